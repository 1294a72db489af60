//! Pairing phase markers and per-phase state machines.
//!
//! Setup and verify progress independently:
//!
//! ```text
//!  Setup:   Idle ──M1──► Started ──M3──► Finished(Ok|Err)
//!  Verify:  Idle ──M1──► Started ──M3──► Finished(Ok|Err)
//! ```

use std::fmt;

use crate::error::MiraError;

// ── Marker ───────────────────────────────────────────────────────

/// Value of the `State` TLV carried by every pairing message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Peer opens a phase (M1).
    Start = 1,
    /// Our reply to `Start` (M2).
    StartResponse = 2,
    /// Peer sends its proof or verification data (M3).
    Finish = 3,
    /// Our reply to `Finish` (M4).
    FinishResponse = 4,
}

impl TryFrom<u8> for Marker {
    type Error = MiraError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Marker::Start),
            2 => Ok(Marker::StartResponse),
            3 => Ok(Marker::Finish),
            4 => Ok(Marker::FinishResponse),
            _ => Err(MiraError::UnknownVariant {
                type_name: "Marker",
                value: value as u64,
            }),
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

// ── SetupPhase ───────────────────────────────────────────────────

/// Pair-setup progress for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SetupPhase {
    #[default]
    Idle,
    Started {
        public_key: [u8; 32],
        salt: [u8; 16],
    },
    Finished(Outcome),
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Started { .. } => write!(f, "SetupStarted"),
            Self::Finished(o) => write!(f, "SetupFinished({o:?})"),
        }
    }
}

impl SetupPhase {
    /// Transition to `Started`.
    ///
    /// Valid from: `Idle`, `Finished` (a new pairing attempt).
    pub fn start(&mut self, public_key: [u8; 32], salt: [u8; 16]) -> Result<(), MiraError> {
        match self {
            Self::Idle | Self::Finished(_) => {
                *self = Self::Started { public_key, salt };
                Ok(())
            }
            Self::Started { .. } => Err(MiraError::Pairing("setup already started")),
        }
    }

    /// Transition to `Finished`, returning the material from `Started`.
    ///
    /// Valid from: `Started`.
    pub fn finish(&mut self, outcome: Outcome) -> Result<([u8; 32], [u8; 16]), MiraError> {
        match *self {
            Self::Started { public_key, salt } => {
                *self = Self::Finished(outcome);
                Ok((public_key, salt))
            }
            _ => Err(MiraError::Pairing("setup finish without start")),
        }
    }
}

// ── VerifyPhase ──────────────────────────────────────────────────

/// Pair-verify progress for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VerifyPhase {
    #[default]
    Idle,
    Started {
        public_key: [u8; 32],
        peer_public_key: Vec<u8>,
    },
    Finished(Outcome),
}

impl fmt::Display for VerifyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Started { .. } => write!(f, "VerifyStarted"),
            Self::Finished(o) => write!(f, "VerifyFinished({o:?})"),
        }
    }
}

impl VerifyPhase {
    /// Transition to `Started`. Every verify start replaces any
    /// previous verify attempt.
    pub fn start(&mut self, public_key: [u8; 32], peer_public_key: Vec<u8>) {
        *self = Self::Started {
            public_key,
            peer_public_key,
        };
    }

    /// Transition to `Finished`, returning both public keys.
    ///
    /// Valid from: `Started`.
    pub fn finish(&mut self, outcome: Outcome) -> Result<([u8; 32], Vec<u8>), MiraError> {
        match std::mem::replace(self, Self::Finished(outcome)) {
            Self::Started {
                public_key,
                peer_public_key,
            } => Ok((public_key, peer_public_key)),
            previous => {
                *self = previous;
                Err(MiraError::Pairing("verify finish without start"))
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_happy_path() {
        let mut phase = SetupPhase::default();
        phase.start([1; 32], [2; 16]).unwrap();
        assert_eq!(phase.to_string(), "SetupStarted");
        let (pk, salt) = phase.finish(Outcome::Success).unwrap();
        assert_eq!(pk, [1; 32]);
        assert_eq!(salt, [2; 16]);
        assert_eq!(phase, SetupPhase::Finished(Outcome::Success));
    }

    #[test]
    fn setup_finish_from_idle_is_rejected() {
        let mut phase = SetupPhase::Idle;
        assert!(phase.finish(Outcome::Success).is_err());
        assert_eq!(phase, SetupPhase::Idle);
    }

    #[test]
    fn setup_double_start_is_rejected() {
        let mut phase = SetupPhase::Idle;
        phase.start([0; 32], [0; 16]).unwrap();
        assert!(phase.start([0; 32], [0; 16]).is_err());
    }

    #[test]
    fn verify_finish_without_start_keeps_state() {
        let mut phase = VerifyPhase::Idle;
        assert!(phase.finish(Outcome::Success).is_err());
        assert_eq!(phase, VerifyPhase::Idle);
    }

    #[test]
    fn verify_restart_replaces_attempt() {
        let mut phase = VerifyPhase::Idle;
        phase.start([1; 32], vec![9; 32]);
        phase.start([2; 32], vec![8; 32]);
        let (pk, peer) = phase.finish(Outcome::Success).unwrap();
        assert_eq!(pk, [2; 32]);
        assert_eq!(peer, vec![8; 32]);
    }

    #[test]
    fn marker_conversion() {
        assert_eq!(Marker::try_from(3).unwrap(), Marker::Finish);
        assert!(Marker::try_from(9).is_err());
    }
}
