//! Streaming Engine
//!
//! Continuous RX/TX sample transport over the bulk data endpoints.
//!
//! - [`pool`]: the fixed arena of transfer buffers and their slot states
//! - [`ring`]: producer/consumer cursors, admission window, completion bookkeeping
//! - [`channel`]: one direction bound to a link, with blocking read/write
//!
//! ```text
//!  caller ──read/write──▶ StreamChannel ──admit──▶ Ring ──submit──▶ UsbLink
//!    ▲                         │                                     │
//!    └────── wake Signal ◀─────┴──────── CompletionSink ◀────────────┘
//! ```

mod pool;
mod ring;

pub mod channel;

pub use channel::StreamChannel;
