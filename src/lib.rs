//! Low-level, race-free filesystem I/O.
//!
//! This crate wraps the native file, directory, section and mapped-memory
//! primitives of POSIX behind a uniform, race-free abstraction: tagged
//! owning handles with safety-fsync close semantics, scatter/gather I/O
//! with deadlines, byte-range locks that surface the platform's sharp
//! edges instead of hiding them, inode-verified relink and unlink, memory
//! sections and views with commit/decommit control, and a single-threaded
//! cooperative reactor multiplexing asynchronous I/O over POSIX AIO.
//!
//! The guiding rule is that the operating system is not papered over:
//! caching modes are first class, `current_path()` is documented as the
//! racy lookup it really is, and where POSIX semantics are treacherous
//! (process-wide byte locks, for example) the treachery is reported to the
//! caller rather than silently absorbed.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::async_file::AsyncFileHandle;
pub use crate::async_file::IoFuture;
pub use crate::async_file::IoState;
pub use crate::async_file::IoStatePtr;
pub use crate::deadline::Deadline;
pub use crate::error::Error;
pub use crate::error::ErrorKind;
pub use crate::error::Result;
pub use crate::file::Creation;
pub use crate::file::FileHandle;
pub use crate::file::Mode;
pub use crate::handle::Caching;
pub use crate::handle::Handle;
pub use crate::handle::HandleFlags;
pub use crate::io::Buffer;
pub use crate::io::ConstBuffer;
pub use crate::io::Extent;
pub use crate::io::ExtentGuard;
pub use crate::io::IoBuffer;
pub use crate::io::IoHandle;
pub use crate::io::IoRequest;
pub use crate::io::bytes_transferred;
pub use crate::map::MapHandle;
pub use crate::mapped_file::MappedFileHandle;
pub use crate::native_handle::Disposition;
pub use crate::native_handle::NativeHandle;
pub use crate::path_handle::PathHandle;
pub use crate::section::SectionFlags;
pub use crate::section::SectionHandle;
pub use crate::service::IoService;
pub use crate::service::ServicePoster;
pub use crate::service::interruption_signal;
pub use crate::stat::Stat;
pub use crate::stat::StatWants;

mod async_file;
mod deadline;
mod error;
mod file;
mod handle;
mod io;
mod map;
mod mapped_file;
mod native_handle;
mod path_handle;
mod section;
mod service;
mod stat;
/// Page arithmetic, randomness and temp-directory discovery.
pub mod utils;
