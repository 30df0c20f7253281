//! Worker binary for multi-process scenarios.
//!
//! The integration tests spawn this binary as child processes to exercise
//! behaviour that only shows up across process boundaries: append
//! atomicity and byte-range lock contention.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;

use lofio::Caching;
use lofio::ConstBuffer;
use lofio::Creation;
use lofio::FileHandle;
use lofio::HandleFlags;
use lofio::IoHandle;
use lofio::IoRequest;
use lofio::Mode;

#[derive(Parser)]
#[command(about = "lofio multi-process test worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Append `count` records of `size` bytes, each filled with `byte`.
    AppendWorker {
        path: PathBuf,
        #[arg(long)]
        byte: u8,
        #[arg(long, default_value_t = 64)]
        count: usize,
        #[arg(long, default_value_t = 4096)]
        size: usize,
    },
    /// Take an exclusive byte-range lock, report it, hold it, release it.
    LockWorker {
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 1024)]
        length: u64,
        #[arg(long, default_value_t = 1500)]
        hold_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    match Args::parse().command {
        Command::AppendWorker {
            path,
            byte,
            count,
            size,
        } => {
            let fh = FileHandle::open(
                &path,
                Mode::Append,
                Creation::IfNeeded,
                Caching::All,
                HandleFlags::empty(),
            )
            .context("opening append target")?;
            let record = vec![byte; size];
            for _ in 0..count {
                let mut bufs = [ConstBuffer::new(&record)];
                let written = fh
                    .write(IoRequest::new(&mut bufs, 0), None)
                    .context("appending record")?;
                anyhow::ensure!(
                    lofio::bytes_transferred(written) == size as u64,
                    "short append"
                );
            }
            Ok(())
        }
        Command::LockWorker {
            path,
            offset,
            length,
            hold_ms,
        } => {
            let fh = FileHandle::open(
                &path,
                Mode::Write,
                Creation::IfNeeded,
                Caching::All,
                HandleFlags::empty(),
            )
            .context("opening lock target")?;
            let guard = fh
                .lock(offset, length, true, None)
                .context("taking exclusive lock")?;
            // Tell the parent the lock is held.
            println!("locked");
            std::io::stdout().flush().ok();
            std::thread::sleep(Duration::from_millis(hold_ms));
            drop(guard);
            Ok(())
        }
    }
}
