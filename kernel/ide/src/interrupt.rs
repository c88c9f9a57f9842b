//! Interrupt-side state for one IDE channel.
//!
//! Each channel (IRQ 14 for the primary, IRQ 15 for the secondary) gets one
//! [`ChannelInterrupt`]. The platform's interrupt service routines call
//! [`ChannelInterrupt::handle_interrupt`] (via the controller's entry points)
//! and then acknowledge the interrupt controller themselves; registering the
//! handlers and issuing the EOI are the platform's responsibility.
//!
//! The only request path that waits for an interrupt is the ATAPI packet
//! read. It arms `atapi_in_progress`, issues the packet, and then waits on
//! the [`CompletionEvent`]; the ISR path reads the channel's status register
//! (which clears the device's interrupt latch) and notifies the event. The
//! event is a lock-free atomic flag, so the ISR never contends with the
//! command in progress for any lock.

use core::sync::atomic::{AtomicBool, Ordering};
use alloc::sync::Arc;
use port_io::{PortIo, PortReadOnly};

/// How many times the ATAPI read path polls its completion event before
/// giving up on the interrupt and failing the request.
pub const ATAPI_COMPLETION_TIMEOUT_POLLS: u64 = 50_000_000;

/// A one-shot completion flag that a waiter polls and an ISR sets.
pub struct CompletionEvent {
	signalled: AtomicBool,
}

impl CompletionEvent {
	pub fn new() -> CompletionEvent {
		CompletionEvent { signalled: AtomicBool::new(false) }
	}

	pub fn clear(&self) {
		self.signalled.store(false, Ordering::Release);
	}

	pub fn notify(&self) {
		self.signalled.store(true, Ordering::Release);
	}

	/// Polls the flag up to `max_polls` times.
	/// Returns `Err` if the flag was never raised within the budget.
	pub fn wait(&self, max_polls: u64) -> Result<(), ()> {
		for _ in 0..max_polls {
			if self.signalled.load(Ordering::Acquire) {
				return Ok(());
			}
			core::hint::spin_loop();
		}
		Err(())
	}
}

/// The interrupt-side state of one IDE channel.
pub struct ChannelInterrupt {
	/// The channel's regular status port. Reading it acknowledges the
	/// device's pending interrupt.
	status: PortReadOnly<u8>,
	/// Set while an ATAPI packet command is waiting for its data-ready
	/// interrupt; gates the wakeup so that stray interrupts (e.g., from the
	/// polled DMA path) don't signal the event.
	atapi_in_progress: AtomicBool,
	event: CompletionEvent,
}

impl ChannelInterrupt {
	/// `status_port` is the channel's command-block status register
	/// (I/O base + 7).
	pub(crate) fn new(io: &Arc<dyn PortIo>, status_port: u16) -> ChannelInterrupt {
		ChannelInterrupt {
			status: PortReadOnly::new(io, status_port),
			atapi_in_progress: AtomicBool::new(false),
			event: CompletionEvent::new(),
		}
	}

	/// The ISR entry point: clears the device's interrupt latch and wakes
	/// the ATAPI waiter if one is armed.
	pub fn handle_interrupt(&self) {
		let _ = self.status.read();
		if self.atapi_in_progress.load(Ordering::Acquire) {
			self.event.notify();
		}
	}

	/// Arms the waiter before an ATAPI packet is issued.
	pub(crate) fn begin_atapi_wait(&self) {
		self.event.clear();
		self.atapi_in_progress.store(true, Ordering::Release);
	}

	/// Disarms the waiter once the packet command has completed (or failed).
	pub(crate) fn end_atapi_wait(&self) {
		self.atapi_in_progress.store(false, Ordering::Release);
	}

	/// Waits for the ISR to signal packet completion.
	pub(crate) fn wait_for_completion(&self) -> Result<(), ()> {
		self.event.wait(ATAPI_COMPLETION_TIMEOUT_POLLS)
	}
}
