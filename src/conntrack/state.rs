use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::conntrack::nat::{ConnKey, format_key, format_translation, translation_to_key};
use crate::model::conntrack::{Con, IpTuple};
use crate::model::{ConnTuple, IpTranslation};

/// Result of registering one conntrack entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Entries written (0, 1 or 2).
    pub inserted: usize,
    /// Insertions rejected because the table was full.
    pub dropped: usize,
}

/// Size-bounded translation table keyed by both sides of every NAT'd
/// connection.
///
/// All map access goes through one reader/writer lock. Nothing is evicted to
/// make room: once `max_size` entries are present, new keys are refused.
pub struct TranslationState {
    entries: RwLock<FxHashMap<ConnKey, IpTranslation>>,
    max_size: usize,
}

impl TranslationState {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn get(&self, key: &ConnKey) -> Option<IpTranslation> {
        self.entries.read().get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store both orientations of a conntrack entry: origin-keyed to the reply
    /// translation and reply-keyed to the origin translation.
    ///
    /// Both writes happen under one write-lock hold, so readers see either
    /// neither or both. If the table fills up between the two, the first write
    /// stays. `on_full` is called once per refused insertion, after the lock
    /// is released.
    pub fn register(&self, c: &Con, mut on_full: impl FnMut()) -> RegisterOutcome {
        let (Some(origin), Some(reply)) = (c.origin.as_ref(), c.reply.as_ref()) else {
            return RegisterOutcome::default();
        };

        let mut outcome = RegisterOutcome::default();
        {
            let mut entries = self.entries.write();
            for (key_tuple, trans_tuple) in [(origin, reply), (reply, origin)] {
                let Some((key, trans)) = format_pair(key_tuple, trans_tuple) else {
                    continue;
                };
                if entries.len() >= self.max_size {
                    outcome.dropped += 1;
                    continue;
                }
                entries.insert(key, trans);
                outcome.inserted += 1;
            }
        }

        for _ in 0..outcome.dropped {
            on_full();
        }
        outcome
    }

    /// Remove a connection's translation, trying the observed direction first
    /// and the far-end view only if that misses.
    ///
    /// A hit also removes the mirror entry the stored translation points at,
    /// which clears both registrations. Returns whether anything was found.
    pub fn delete(&self, c: &ConnTuple) -> bool {
        let forward = ConnKey::from_conn(c);
        let reverse = forward.reversed();

        let hit = {
            let mut entries = self.entries.write();
            let found = [forward, reverse].into_iter().find(|k| match entries.remove(k) {
                Some(t) => {
                    entries.remove(&translation_to_key(k.transport, &t));
                    true
                }
                None => false,
            });
            found
        };

        match hit {
            Some(k) => {
                log::trace!("deleted {k:?} from conntrack");
                true
            }
            None => {
                log::trace!("not deleting {forward:?} or {reverse:?} from conntrack");
                false
            }
        }
    }

    /// Release backing storage left over from deleted entries. Contents are
    /// unchanged.
    pub fn compact(&self) {
        self.entries.write().shrink_to_fit();
    }

    /// Allocated slots in the backing map.
    pub fn capacity(&self) -> usize {
        self.entries.read().capacity()
    }

    /// Copy of every cached pair, in no particular order.
    pub fn entries(&self) -> Vec<(ConnKey, IpTranslation)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}

fn format_pair(key_tuple: &IpTuple, trans_tuple: &IpTuple) -> Option<(ConnKey, IpTranslation)> {
    Some((format_key(key_tuple)?, format_translation(trans_tuple)?))
}
