//! Error types for the simulator

use thiserror::Error;

/// Result type alias for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Error types that can occur while building or running a simulation
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigParse(String),

    #[error("Link has no peer connected")]
    NoPeerConnected,

    #[error("Unknown video id: {0}")]
    UnknownVideo(String),

    #[error("Response to unknown request id {0}")]
    UnexpectedResponse(u64),

    #[error("Video chunk for {0} was never requested")]
    UnsolicitedVideoChunk(String),

    #[error("Forwarded chunk from peer {0} carries no size")]
    ChunkMissingSize(u64),

    #[error("Trace parse error: {0}")]
    TraceParse(String),

    #[error("Catalog parse error: {0}")]
    CatalogParse(String),

    #[error("Stats output error: {0}")]
    StatsOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
