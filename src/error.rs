// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the replication engine.
//!
//! One enum per subsystem rather than a single flat error type, so call
//! sites can match on exactly the outcomes that subsystem can produce.
//! `EngineError` is the facade-level union `?` composes into.

use std::fmt;

/// Result type for certification-index operations.
pub type CertResult<T> = Result<T, CertError>;

/// Errors produced by [`crate::cert::CertIndex::append_trx`] and friends.
#[derive(Debug)]
pub enum CertError {
    /// A key conflict was realized against an existing reference.
    TestFailed {
        /// The key bytes that produced the conflict.
        key: Vec<u8>,
        /// Seqno of the writeset holding the conflicting reference.
        conflicting_seqno: i64,
    },
    /// Writeset version incompatible with the index's certification version.
    ProtocolMismatch { writeset_version: u32, cert_version: u32 },
    /// `last_seen_seqno` below the index's initial position, or the
    /// certification window implied by `global_seqno - last_seen_seqno`
    /// exceeds `cert.max_length`.
    OutOfRange { last_seen_seqno: i64, initial_position: i64 },
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TestFailed { key, conflicting_seqno } => write!(
                f,
                "certification failed: key {:?} conflicts with writeset at seqno {}",
                key, conflicting_seqno
            ),
            Self::ProtocolMismatch { writeset_version, cert_version } => write!(
                f,
                "protocol mismatch: writeset version {} incompatible with certification version {}",
                writeset_version, cert_version
            ),
            Self::OutOfRange { last_seen_seqno, initial_position } => write!(
                f,
                "last_seen_seqno {} out of range (initial position {})",
                last_seen_seqno, initial_position
            ),
        }
    }
}

impl std::error::Error for CertError {}

/// Result type for gcache operations.
pub type GcacheResult<T> = Result<T, GcacheError>;

/// Errors produced by the gcache façade and its three stores.
#[derive(Debug)]
pub enum GcacheError {
    /// No tier could find room for the requested allocation, even after
    /// attempting to create a new page. Treated as fatal by callers per
    /// the engine's error-handling design: data loss is unacceptable.
    AllocationFull { requested: usize },
    /// Ring-buffer recovery found contradictory collisions that could not
    /// be resolved by payload hash comparison.
    RecoveryInconsistent { detail: String },
    /// Underlying filesystem or mmap operation failed.
    Io(std::io::Error),
    /// Pointer passed to `free`/`realloc`/`seqno_assign` is not a buffer
    /// this gcache instance owns.
    NotFound,
    /// `seqno_assign` called twice for the same buffer, or with a seqno
    /// not strictly greater than the current maximum.
    InvalidSeqnoAssign { seqno: i64 },
}

impl fmt::Display for GcacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFull { requested } => {
                write!(f, "gcache allocation of {} bytes failed in every tier", requested)
            }
            Self::RecoveryInconsistent { detail } => {
                write!(f, "ring buffer recovery inconsistent: {}", detail)
            }
            Self::Io(e) => write!(f, "gcache I/O error: {}", e),
            Self::NotFound => write!(f, "buffer not found"),
            Self::InvalidSeqnoAssign { seqno } => {
                write!(f, "invalid seqno_assign for seqno {}", seqno)
            }
        }
    }
}

impl std::error::Error for GcacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GcacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Outcome of a monitor wait that did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// The wait was interrupted by [`crate::monitor::OrderingMonitor::interrupt`];
    /// the caller must treat this as a must-replay signal, not a crash.
    Interrupted,
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "monitor wait interrupted"),
        }
    }
}

impl std::error::Error for MonitorError {}

/// Top-level error the public replication API returns to the host.
#[derive(Debug)]
pub enum EngineError {
    Certification(CertError),
    Gcache(GcacheError),
    Monitor(MonitorError),
    /// The host must replay the writeset (MUST_ABORT -> MUST_REPLAY path).
    MustReplay,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Certification(e) => write!(f, "{}", e),
            Self::Gcache(e) => write!(f, "{}", e),
            Self::Monitor(e) => write!(f, "{}", e),
            Self::MustReplay => write!(f, "writeset must be replayed"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Certification(e) => Some(e),
            Self::Gcache(e) => Some(e),
            Self::Monitor(e) => Some(e),
            Self::MustReplay => None,
        }
    }
}

impl From<CertError> for EngineError {
    fn from(e: CertError) -> Self {
        Self::Certification(e)
    }
}

impl From<GcacheError> for EngineError {
    fn from(e: GcacheError) -> Self {
        Self::Gcache(e)
    }
}

impl From<MonitorError> for EngineError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::Interrupted => Self::MustReplay,
        }
    }
}
