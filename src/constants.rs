//! Application-wide constants for scbridge.
//!
//! This module centralizes wire event names, defaults and sizing constants
//! so the server, client and bridge agree on them.
//!
//! # Categories
//!
//! - **Protocol**: Event names carried in the transport envelope
//! - **Defaults**: Listen address, model and pool sizing
//! - **Process I/O**: Pipe read sizing

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Client → server: a serialized change set to author.
pub const EVENT_SUBMIT: &str = "sc_update_to_author";

/// Server → client: submission admitted, carries the submission id.
pub const EVENT_ACCEPTED: &str = "sc_author_accepted";

/// Server → client: one reassembled line of authoring output.
pub const EVENT_OUTPUT: &str = "sc_author_output";

/// Server → client: typed completion signal for a submission.
pub const EVENT_COMPLETE: &str = "sc_author_complete";

/// Server → client: a submission or message was refused.
pub const EVENT_REJECTED: &str = "sc_author_rejected";

// ============================================================================
// Defaults
// ============================================================================

/// Default WebSocket listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";

/// Default model identifier passed to the authoring executable.
pub const DEFAULT_MODEL_ID: &str = "microengine";

/// Default authoring executable name, resolved through `PATH`.
pub const DEFAULT_EXECUTABLE: &str = "libsc_author";

/// Default number of authoring processes allowed to run at once.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default number of admitted submissions allowed to wait for a worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Default wall-clock limit for one authoring process.
pub const DEFAULT_SUBMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Environment variable used for the native library search path.
#[cfg(target_os = "macos")]
pub const DEFAULT_LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";

/// Environment variable used for the native library search path.
#[cfg(windows)]
pub const DEFAULT_LIBRARY_PATH_VAR: &str = "PATH";

/// Environment variable used for the native library search path.
#[cfg(not(any(target_os = "macos", windows)))]
pub const DEFAULT_LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

// ============================================================================
// Process I/O
// ============================================================================

/// Size of each read from a child's stdout/stderr pipe.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;
