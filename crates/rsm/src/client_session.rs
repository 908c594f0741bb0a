//! Client-side proposal sessions.
//!
//! A session gives each proposal a series id so a retried proposal is
//! applied at most once. Register and unregister are themselves proposals,
//! identified by reserved series ids.

use common::{Entry, GroupId, SmError, SmResult, NOT_SESSION_MANAGED_CLIENT_ID};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Series id of a no-op session; entries are applied without tracking.
pub const NOOP_SERIES_ID: u64 = 0;
/// Series id marking a register-session proposal.
pub const SERIES_ID_FOR_REGISTER: u64 = u64::MAX - 1;
/// Series id marking an unregister-session proposal.
pub const SERIES_ID_FOR_UNREGISTER: u64 = u64::MAX;
/// First series id used for regular proposals.
pub const SERIES_ID_FIRST_PROPOSAL: u64 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub group_id: GroupId,
    pub client_id: u64,
    pub series_id: u64,
    pub responded_to: u64,
}

impl ClientSession {
    /// A new, not yet registered session with a random client id.
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            client_id: random_client_id(),
            series_id: NOOP_SERIES_ID + 1,
            responded_to: 0,
        }
    }

    /// A session whose proposals are not deduplicated.
    pub fn new_noop(group_id: GroupId) -> Self {
        Self {
            group_id,
            client_id: random_client_id(),
            series_id: NOOP_SERIES_ID,
            responded_to: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.series_id == NOOP_SERIES_ID
    }

    pub fn group_must_match(&self, group_id: GroupId) -> SmResult<()> {
        if self.group_id != group_id {
            return Err(SmError::Session(format!(
                "session belongs to group {}, not {}",
                self.group_id.0, group_id.0
            )));
        }
        Ok(())
    }

    pub fn prepare_for_register(&mut self) -> SmResult<()> {
        self.ensure_regular()?;
        self.series_id = SERIES_ID_FOR_REGISTER;
        Ok(())
    }

    pub fn prepare_for_unregister(&mut self) -> SmResult<()> {
        self.ensure_regular()?;
        self.series_id = SERIES_ID_FOR_UNREGISTER;
        Ok(())
    }

    pub fn prepare_for_propose(&mut self) -> SmResult<()> {
        self.ensure_regular()?;
        self.series_id = SERIES_ID_FIRST_PROPOSAL;
        Ok(())
    }

    /// Advance past a completed (or abandoned) proposal.
    pub fn proposal_completed(&mut self) -> SmResult<()> {
        self.ensure_regular()?;
        if self.series_id != self.responded_to + 1 {
            return Err(SmError::Session(format!(
                "series id {} does not follow responded-to {}",
                self.series_id, self.responded_to
            )));
        }
        self.responded_to = self.series_id;
        self.series_id += 1;
        Ok(())
    }

    /// Whether regular proposals may be made with this session.
    pub fn valid_for_proposal(&self, group_id: GroupId) -> bool {
        if self.group_id != group_id || self.client_id == NOT_SESSION_MANAGED_CLIENT_ID {
            return false;
        }
        if self.series_id == SERIES_ID_FOR_REGISTER || self.series_id == SERIES_ID_FOR_UNREGISTER {
            return false;
        }
        self.responded_to <= self.series_id
    }

    /// Whether a register/unregister proposal may be made with this session.
    pub fn valid_for_session_op(&self, group_id: GroupId) -> bool {
        if self.group_id != group_id {
            return false;
        }
        if self.client_id == NOT_SESSION_MANAGED_CLIENT_ID || self.series_id == NOOP_SERIES_ID {
            return false;
        }
        self.series_id == SERIES_ID_FOR_REGISTER || self.series_id == SERIES_ID_FOR_UNREGISTER
    }

    /// Stamp a command with this session's identity for log position `index`.
    pub fn entry(&self, index: u64, cmd: impl Into<Vec<u8>>) -> Entry {
        Entry::new(index, cmd).with_session(self.client_id, self.series_id, self.responded_to)
    }

    fn ensure_regular(&self) -> SmResult<()> {
        if self.client_id == NOT_SESSION_MANAGED_CLIENT_ID || self.series_id == NOOP_SERIES_ID {
            return Err(SmError::Session("not a regular session".into()));
        }
        Ok(())
    }
}

fn random_client_id() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != NOT_SESSION_MANAGED_CLIENT_ID {
            return id;
        }
    }
}
