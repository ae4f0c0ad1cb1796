//! mux-core: shared library for the mux session layer.
//!
//! Provides the error type, the multi-buffer model with reader/writer
//! capabilities, stream/packet read adapters, and the rendezvous handoff
//! used by the token scheduler.

pub mod buf;
pub mod error;
pub mod handoff;
pub mod reader;

// Re-export commonly used items at crate root.
pub use buf::{pipe, BufferedReader, Link, MultiBuffer, PipeReader, PipeWriter, Reader, Writer, BUFFER_SIZE};
pub use error::{MuxError, MuxResult};
pub use handoff::{Handoff, TryOfferError, Waiter};
pub use reader::{encode_chunk, PacketReader, StreamReader, TransferType};
