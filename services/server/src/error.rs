use thiserror::Error;

/// Why the realtime bridge stopped serving a session.
///
/// The distinction drives the fallback protocol: a failure before the first
/// audio byte reached the client is recoverable by switching to the legacy
/// pipeline; a failure after that point ends the session, because the two
/// paths have incompatible audio formats and a mid-stream switch would
/// double-deliver or drop audio.
#[derive(Debug, Error)]
pub enum BridgeFailure {
    #[error("realtime channel failed before any audio was delivered: {0}")]
    BeforeAudio(#[source] anyhow::Error),
    #[error("realtime channel failed after audio delivery began: {0}")]
    AfterAudio(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection token resolved to no student profile. Fatal before any
    /// audio is exchanged.
    #[error("missing or unknown credentials")]
    MissingCredentials,

    /// A pipeline state transition the state machine does not permit.
    #[error("pipeline transition not permitted: {0}")]
    Transition(&'static str),

    #[error(transparent)]
    Bridge(#[from] BridgeFailure),

    /// The audio conversion subprocess failed.
    #[error("audio transcoder failed: {0}")]
    Transcode(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
