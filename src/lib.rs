#![no_std]

extern crate alloc;

mod clock;
mod device;
mod error;
mod fence;
mod irq;
mod job;
mod lifecycle;
mod memory;
mod regs;
mod reset;
mod ring;
mod scheduler;
mod validator;
mod wire;

pub use clock::{Clock, Deadline};
pub use device::{DeviceContext, TickSummary};
pub use error::{Error, Result};
pub use fence::FenceEngine;
pub use irq::{IrqCore, IrqHandlers};
pub use job::{JobId, JobResult, JobState, JobType, Priority, DEFAULT_TIMEOUT_MS};
pub use lifecycle::{LifecycleController, LifecyclePhase};
pub use memory::{Allocator, Dma};
pub use regs::{control_bit, irq_bit, offset, status_bit, QueueBank, Registers};
pub use reset::{ResetController, DEFAULT_HANG_TIMEOUT_MS, DEFAULT_HEARTBEAT_MISS_THRESHOLD};
pub use ring::{CommandRing, MAX_RING_SIZE, MIN_RING_SIZE};
pub use scheduler::{Scheduler, DEFAULT_QUEUE_DEPTH};
pub use validator::ValidationContext;
pub use wire::{CommandHeader, DmaRecord, DrawRecord, FenceRecord, Opcode, FLAG_PRIVILEGED};
