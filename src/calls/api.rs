//! Collaborator seams for the call REST API and call history.

use super::{CallId, EndReason};
use async_trait::async_trait;
use crate::wire::CallKind;
use serde::{Deserialize, Serialize};

/// Server acknowledgement of a call initiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInitiateResponse {
    pub call_id: CallId,
    pub participants: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signaling_url: Option<String>,
}

/// Control-plane operations backing call setup and teardown. The transport
/// (HTTP, in practice) lives behind this seam.
#[async_trait]
pub trait CallApi: Send + Sync {
    async fn initiate(
        &self,
        participants: &[String],
        kind: CallKind,
    ) -> Result<CallInitiateResponse, String>;

    async fn join(&self, call_id: &CallId) -> Result<(), String>;

    /// Asks the server to pull another user into a running call. The server
    /// delivers the incoming-call push; the invitee shows up on the signaling
    /// channel as an ordinary `join`.
    async fn invite(&self, call_id: &CallId, user_id: &str) -> Result<(), String>;

    /// Best-effort; teardown proceeds locally even when this fails.
    async fn end(&self, call_id: &CallId) -> Result<(), String>;
}

/// Summary of a finished call, emitted exactly once at teardown.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub kind: CallKind,
    /// Seconds spent in the active state, absent when the call never
    /// connected.
    pub duration_secs: Option<i64>,
    pub end_reason: EndReason,
}

/// Receives one record per call at the end of its lifecycle.
pub trait CallHistorySink: Send + Sync {
    fn call_ended(&self, record: CallRecord);
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    pub struct MockCallApi {
        pub initiations: AtomicU32,
        pub joins: Mutex<Vec<CallId>>,
        pub invites: Mutex<Vec<(CallId, String)>>,
        pub ends: Mutex<Vec<CallId>>,
        pub reject_initiate: AtomicBool,
        /// When set, `initiate` answers with this server-assigned id instead
        /// of echoing a generated one.
        pub assigned_call_id: Mutex<Option<CallId>>,
    }

    #[async_trait]
    impl CallApi for MockCallApi {
        async fn initiate(
            &self,
            participants: &[String],
            _kind: CallKind,
        ) -> Result<CallInitiateResponse, String> {
            self.initiations.fetch_add(1, Ordering::SeqCst);
            if self.reject_initiate.load(Ordering::SeqCst) {
                return Err("call rejected by server".to_string());
            }
            let call_id = self
                .assigned_call_id
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(CallId::generate);
            Ok(CallInitiateResponse {
                call_id,
                participants: participants.to_vec(),
                signaling_url: None,
            })
        }

        async fn join(&self, call_id: &CallId) -> Result<(), String> {
            self.joins.lock().unwrap().push(call_id.clone());
            Ok(())
        }

        async fn invite(&self, call_id: &CallId, user_id: &str) -> Result<(), String> {
            self.invites
                .lock()
                .unwrap()
                .push((call_id.clone(), user_id.to_string()));
            Ok(())
        }

        async fn end(&self, call_id: &CallId) -> Result<(), String> {
            self.ends.lock().unwrap().push(call_id.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingHistory {
        pub records: Mutex<Vec<CallRecord>>,
    }

    impl CallHistorySink for RecordingHistory {
        fn call_ended(&self, record: CallRecord) {
            self.records.lock().unwrap().push(record);
        }
    }
}
