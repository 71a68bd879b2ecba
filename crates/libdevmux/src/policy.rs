use std::collections::HashSet;

use crate::sink::StreamHandle;

/// The already-authenticated caller a handler acts for.
#[derive(Debug, Clone)]
pub struct Caller {
    pub stream: StreamHandle,
    pub peer_uid: Option<u32>,
}

/// Decides whether a caller may run terminal operations at all.
pub trait ExecutePolicy: Send + Sync {
    fn can_execute(&self, caller: &Caller) -> bool;
}

impl<F> ExecutePolicy for F
where
    F: Fn(&Caller) -> bool + Send + Sync,
{
    fn can_execute(&self, caller: &Caller) -> bool {
        self(caller)
    }
}

pub struct AllowAll;

impl ExecutePolicy for AllowAll {
    fn can_execute(&self, _caller: &Caller) -> bool {
        true
    }
}

/// Denies execute to the listed peer uids. Callers without a known uid are
/// denied too whenever the list is non-empty.
pub struct ReadOnlyUids {
    uids: HashSet<u32>,
}

impl ReadOnlyUids {
    pub fn new(uids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            uids: uids.into_iter().collect(),
        }
    }
}

impl ExecutePolicy for ReadOnlyUids {
    fn can_execute(&self, caller: &Caller) -> bool {
        if self.uids.is_empty() {
            return true;
        }
        caller
            .peer_uid
            .is_some_and(|uid| !self.uids.contains(&uid))
    }
}
