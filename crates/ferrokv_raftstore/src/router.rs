//! Routes [`Msg`]s to the mailbox of the region they address.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use dashmap::DashMap;
use ferrokv_common::error::RouterError;
use ferrokv_common::RegionId;

use crate::msg::{Msg, RegionMsg};

/// Cloneable handle to the per-region mailboxes of a store.
#[derive(Clone, Default)]
pub struct Router {
    mailboxes: Arc<DashMap<RegionId, Sender<RegionMsg>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the mailbox of `region_id`.
    pub fn register(&self, region_id: RegionId, mailbox: Sender<RegionMsg>) {
        if self.mailboxes.insert(region_id, mailbox).is_some() {
            tracing::debug!(region_id, "replaced region mailbox");
        }
    }

    pub fn unregister(&self, region_id: RegionId) -> bool {
        self.mailboxes.remove(&region_id).is_some()
    }

    pub fn is_registered(&self, region_id: RegionId) -> bool {
        self.mailboxes.contains_key(&region_id)
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }

    /// Deliver `msg`. A closed mailbox is removed.
    pub fn send(&self, region_id: RegionId, msg: Msg) -> Result<(), RouterError> {
        let msg_type = msg.msg_type();
        let sent = match self.mailboxes.get(&region_id) {
            Some(mailbox) => mailbox.send(RegionMsg { region_id, msg }).is_ok(),
            None => {
                tracing::debug!(region_id, ?msg_type, "no mailbox for region");
                return Err(RouterError::RegionNotFound(region_id));
            }
        };
        if sent {
            Ok(())
        } else {
            self.mailboxes.remove(&region_id);
            tracing::warn!(region_id, ?msg_type, "region mailbox disconnected");
            Err(RouterError::Disconnected(region_id))
        }
    }
}
