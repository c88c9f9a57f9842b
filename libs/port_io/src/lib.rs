//! CPU-level port I/O with a Rust-like typed API.
//!
//! The typed wrappers [`Port`], [`PortReadOnly`], and [`PortWriteOnly`] access
//! a single I/O port at the granularity of their type parameter (`u8`, `u16`,
//! or `u32`). Rather than issuing `in`/`out` instructions directly, each
//! wrapper routes its accesses through a shared [`PortIo`] backend object.
//! On bare metal the backend is [`RawPortIo`], which executes the real
//! instructions; a software model of a device can stand in for it instead,
//! which is how drivers built on this crate are tested off-hardware.
//!
//! Every access through a backend is a hardware-ordering point: `RawPortIo`
//! uses inline assembly, which the compiler cannot reorder or elide.

#![no_std]

extern crate alloc;

use core::fmt;
use core::marker::PhantomData;
use alloc::sync::Arc;

/// Raw access to the x86 I/O port space.
///
/// Implementations must treat every call as a volatile access with
/// device-visible side effects.
pub trait PortIo: Send + Sync {
    fn read_u8(&self, port: u16) -> u8;
    fn write_u8(&self, port: u16, value: u8);
    fn read_u16(&self, port: u16) -> u16;
    fn write_u16(&self, port: u16, value: u16);
    fn read_u32(&self, port: u16) -> u32;
    fn write_u32(&self, port: u16, value: u32);
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// A value that can be transferred over an I/O port: `u8`, `u16`, or `u32`.
pub trait InOut: sealed::Sealed + Copy {
    fn port_read(io: &dyn PortIo, port: u16) -> Self;
    fn port_write(io: &dyn PortIo, port: u16, value: Self);
}

impl InOut for u8 {
    fn port_read(io: &dyn PortIo, port: u16) -> u8 { io.read_u8(port) }
    fn port_write(io: &dyn PortIo, port: u16, value: u8) { io.write_u8(port, value) }
}
impl InOut for u16 {
    fn port_read(io: &dyn PortIo, port: u16) -> u16 { io.read_u16(port) }
    fn port_write(io: &dyn PortIo, port: u16, value: u16) { io.write_u16(port, value) }
}
impl InOut for u32 {
    fn port_read(io: &dyn PortIo, port: u16) -> u32 { io.read_u32(port) }
    fn port_write(io: &dyn PortIo, port: u16, value: u32) { io.write_u32(port, value) }
}

/// A readable and writable I/O port of width `T`.
pub struct Port<T: InOut> {
    io: Arc<dyn PortIo>,
    port: u16,
    _phantom: PhantomData<T>,
}

impl<T: InOut> Port<T> {
    /// Creates a port wrapper for the given port number, accessed through `io`.
    pub fn new(io: &Arc<dyn PortIo>, port: u16) -> Port<T> {
        Port { io: Arc::clone(io), port, _phantom: PhantomData }
    }

    /// Returns the port number this wrapper accesses.
    pub fn port_address(&self) -> u16 {
        self.port
    }

    /// Reads a value from this port.
    pub fn read(&self) -> T {
        T::port_read(&*self.io, self.port)
    }

    /// Writes a value to this port.
    ///
    /// # Safety
    /// Writing to a hardware port can have arbitrary device-specific effects,
    /// so the caller must know what the device on the other end expects.
    pub unsafe fn write(&self, value: T) {
        T::port_write(&*self.io, self.port, value);
    }
}

/// A read-only I/O port of width `T`.
pub struct PortReadOnly<T: InOut> {
    inner: Port<T>,
}

impl<T: InOut> PortReadOnly<T> {
    pub fn new(io: &Arc<dyn PortIo>, port: u16) -> PortReadOnly<T> {
        PortReadOnly { inner: Port::new(io, port) }
    }

    pub fn port_address(&self) -> u16 {
        self.inner.port_address()
    }

    /// Reads a value from this port.
    pub fn read(&self) -> T {
        self.inner.read()
    }
}

/// A write-only I/O port of width `T`.
pub struct PortWriteOnly<T: InOut> {
    inner: Port<T>,
}

impl<T: InOut> PortWriteOnly<T> {
    pub fn new(io: &Arc<dyn PortIo>, port: u16) -> PortWriteOnly<T> {
        PortWriteOnly { inner: Port::new(io, port) }
    }

    pub fn port_address(&self) -> u16 {
        self.inner.port_address()
    }

    /// Writes a value to this port.
    ///
    /// # Safety
    /// Same contract as [`Port::write`].
    pub unsafe fn write(&self, value: T) {
        self.inner.write(value);
    }
}

impl<T: InOut> Clone for Port<T> {
    fn clone(&self) -> Self {
        Port { io: Arc::clone(&self.io), port: self.port, _phantom: PhantomData }
    }
}
impl<T: InOut> Clone for PortReadOnly<T> {
    fn clone(&self) -> Self {
        PortReadOnly { inner: self.inner.clone() }
    }
}
impl<T: InOut> Clone for PortWriteOnly<T> {
    fn clone(&self) -> Self {
        PortWriteOnly { inner: self.inner.clone() }
    }
}

impl<T: InOut> fmt::Debug for Port<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Port({:#06x})", self.port)
    }
}
impl<T: InOut> fmt::Debug for PortReadOnly<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PortReadOnly({:#06x})", self.inner.port)
    }
}
impl<T: InOut> fmt::Debug for PortWriteOnly<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PortWriteOnly({:#06x})", self.inner.port)
    }
}

/// The backend that executes real `in`/`out` instructions.
///
/// Only meaningful in ring 0 (or with IOPL raised); construct it with
/// [`RawPortIo::new`] and share it as the `Arc<dyn PortIo>` that all of a
/// machine's port wrappers are built from.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub struct RawPortIo {
    _private: (),
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl RawPortIo {
    /// # Safety
    /// The caller must be privileged enough to execute `in`/`out`
    /// instructions, i.e., running in kernel mode.
    pub unsafe fn new() -> Arc<dyn PortIo> {
        Arc::new(RawPortIo { _private: () })
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortIo for RawPortIo {
    fn read_u8(&self, port: u16) -> u8 {
        let value: u8;
        unsafe { core::arch::asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags)); }
        value
    }
    fn write_u8(&self, port: u16, value: u8) {
        unsafe { core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)); }
    }
    fn read_u16(&self, port: u16) -> u16 {
        let value: u16;
        unsafe { core::arch::asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack, preserves_flags)); }
        value
    }
    fn write_u16(&self, port: u16, value: u16) {
        unsafe { core::arch::asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags)); }
    }
    fn read_u32(&self, port: u16) -> u32 {
        let value: u32;
        unsafe { core::arch::asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack, preserves_flags)); }
        value
    }
    fn write_u32(&self, port: u16, value: u32) {
        unsafe { core::arch::asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags)); }
    }
}
