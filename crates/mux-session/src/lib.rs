//! mux-session: the session layer of the stream multiplexer.
//!
//! Many logical [`Session`]s share one physical transport. A
//! [`SessionManager`] owns them, hands out 16-bit IDs, and runs a token
//! scheduler task that decides which waiting session may read next.
//!
//! ```no_run
//! use mux_core::{pipe, Link, MuxResult, TransferType};
//! use mux_session::SessionManager;
//!
//! # async fn example() -> MuxResult<()> {
//! let manager = SessionManager::new();
//!
//! let (input, _feed) = pipe(16);
//! let (_drain, output) = pipe(16);
//! let session = manager
//!     .allocate(TransferType::Stream, Link::new(input, output))
//!     .await
//!     .expect("manager is open");
//!
//! let mb = session.read_multi_buffer().await?;
//! println!("read {} bytes", mb.len());
//!
//! session.close().await?;
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ManagerConfig;
pub use manager::{ManagerStats, SessionManager};
pub use scheduler::SchedulerState;
pub use session::Session;

// Re-export mux-core types used in this crate's signatures.
pub use mux_core::{Link, MultiBuffer, MuxError, MuxResult, TransferType};
