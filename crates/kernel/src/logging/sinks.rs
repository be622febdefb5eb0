//! Built-in log sinks
//!
//! x86_64 machines get the classic pair: the COM1 UART and the qemu/bochs
//! debugcon port. Both are tunable from the command line (`npk.x86.*` keys).
//! Hosted builds register their sink from the test harness instead.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86::init_early_sinks;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init_early_sinks() {}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86 {
    use core::fmt::Write;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;
    use uart_16550::SerialPort;

    use super::super::{LogMessage, LogSink};

    const COM1_PORT: u16 = 0x3F8;
    const DEBUGCON_PORT: u16 = 0xE9;

    struct SerialSink {
        port: Mutex<SerialPort>,
    }

    impl LogSink for SerialSink {
        fn reset(&self) {
            self.port.lock().init();
        }

        fn write(&self, msg: &LogMessage) {
            let mut port = self.port.lock();
            let _ = write!(
                port,
                "[{:>6}.{:06}] {} c{}: {}\r\n",
                msg.timestamp_nanos / 1_000_000_000,
                (msg.timestamp_nanos % 1_000_000_000) / 1_000,
                msg.level.as_str(),
                msg.cpu,
                msg.text
            );
        }
    }

    struct DebugconSink {
        colour: AtomicBool,
    }

    impl DebugconSink {
        fn put_bytes(&self, bytes: &[u8]) {
            for &byte in bytes {
                unsafe {
                    core::arch::asm!("out dx, al", in("dx") DEBUGCON_PORT, in("al") byte,
                        options(nostack, nomem));
                }
            }
        }
    }

    impl LogSink for DebugconSink {
        fn write(&self, msg: &LogMessage) {
            if self.colour.load(Ordering::Relaxed) {
                let colour: &[u8] = match msg.level {
                    crate::logging::LogLevel::Error => b"\x1b[31m",
                    crate::logging::LogLevel::Warn => b"\x1b[33m",
                    crate::logging::LogLevel::Debug | crate::logging::LogLevel::Trace => {
                        b"\x1b[90m"
                    }
                    _ => b"\x1b[0m",
                };
                self.put_bytes(colour);
            }
            self.put_bytes(msg.level.as_str().as_bytes());
            self.put_bytes(b" ");
            self.put_bytes(msg.text.as_bytes());
            if self.colour.load(Ordering::Relaxed) {
                self.put_bytes(b"\x1b[0m");
            }
            self.put_bytes(b"\r\n");
        }
    }

    static SERIAL: SerialSink = SerialSink {
        port: Mutex::new(unsafe { SerialPort::new(COM1_PORT) }),
    };
    static DEBUGCON: DebugconSink = DebugconSink {
        colour: AtomicBool::new(false),
    };

    /// Register the platform sinks; called once the config store is up.
    pub fn init_early_sinks() {
        DEBUGCON.colour.store(
            crate::config::get_bool("npk.x86.debugcon_do_colour", false),
            Ordering::Relaxed,
        );
        super::super::add_sink(&DEBUGCON);

        if crate::config::get_bool("npk.x86.com1_enabled", true) {
            super::super::add_sink(&SERIAL);
        }
    }
}
