//! The Tern kernel: a preemptive real-time kernel for small single-core
//! microcontrollers.
//!
//! The kernel is a state machine. It owns every control block and all
//! scheduling state in one [`Kernel`] value, and it never runs user thread
//! code itself: the surrounding port layer performs the actual context
//! switches, drives [`Kernel::tick`] from its tick interrupt, brackets
//! interrupt handlers with [`Kernel::interrupt_enter`] /
//! [`Kernel::interrupt_exit`], and wires [`Kernel::deferred_dispatch`] to a
//! low-priority interrupt. A service call that must block parks the caller
//! and returns [`Wait::Pending`]; the outcome of the wait is delivered
//! through [`Kernel::take_wakeup`] when the thread is next scheduled.
//!
//! Scheduling is preemptive by priority (higher number runs first), FIFO
//! among equals, with optional round robin. Every blocking primitive wakes
//! waiters strictly in priority order, including when the releasing event
//! arrives from interrupt context through the deferred queue.
//!
//! ```
//! use tern_kernel::{Config, Kernel, ThreadAttr};
//!
//! fn worker(_: usize) {}
//!
//! let mut kernel = Kernel::new(Config::default())?;
//! let worker_id = kernel.thread_spawn(ThreadAttr::new(worker).name("worker").priority(5))?;
//! kernel.start()?;
//! assert_eq!(kernel.current_thread(), Some(worker_id));
//! # Ok::<(), tern_kernel::Error>(())
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod deferred;
mod error;
mod event_flags;
mod kernel;
mod list;
mod mempool;
mod msgqueue;
mod mutex;
mod sched;
mod semaphore;
mod thread;
mod timer;
mod utils;
mod wait;

pub use crate::error::{Error, FatalError, FatalHook, Result, Wait};
pub use crate::event_flags::{EventFlagsId, WaitOptions};
pub use crate::kernel::{Config, Kernel, KernelState, Ticks, WAIT_FOREVER};
pub use crate::mempool::{Block, PoolId};
pub use crate::msgqueue::{Message, QueueId};
pub use crate::mutex::{MutexAttr, MutexId, MUTEX_LOCK_LIMIT};
pub use crate::semaphore::SemaphoreId;
pub use crate::thread::{ThreadAttr, ThreadId, ThreadState, ThreadStatus, NAME_LEN};
pub use crate::timer::{TimerId, TimerType};
pub use crate::wait::Wakeup;
