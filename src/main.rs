#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate rlibc;

#[cfg(target_os = "none")]
mod boot {
    use core::panic::PanicInfo;
    use core::ptr::addr_of_mut;

    use bootloader_api::{entry_point, BootInfo};
    use linked_list_allocator::LockedHeap;
    use log::LevelFilter;

    use envkern::kernel::init_kernel;
    use envkern::{logger, println, KernelConfig};

    const HEAP_SIZE: usize = 4 * 1024 * 1024;

    #[repr(C, align(4096))]
    struct HeapArea([u8; HEAP_SIZE]);

    static mut HEAP: HeapArea = HeapArea([0; HEAP_SIZE]);

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    entry_point!(kernel_main);

    fn kernel_main(_boot_info: &'static mut BootInfo) -> ! {
        unsafe {
            ALLOCATOR
                .lock()
                .init(addr_of_mut!(HEAP).cast::<u8>(), HEAP_SIZE);
        }

        if let Err(e) = logger::init(LevelFilter::Info) {
            println!("Failed to install logger: {}", e);
        }

        if init_kernel(KernelConfig::default()).is_err() {
            println!("Kernel initialization failed!");
            loop_arch_mm();
        }

        #[cfg(feature = "boot_selftest")]
        println!("{}", envkern::selftest::test_all());

        // Nothing to run yet: every clock tick enters the trap path from
        // this loop and returns to it.
        x86_64::instructions::interrupts::enable();
        loop {
            x86_64::instructions::hlt();
        }
    }

    fn loop_arch_mm() -> ! {
        loop {
            unsafe {
                core::arch::x86_64::_mm_pause();
            }
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        x86_64::instructions::interrupts::disable();
        let msg = info.message();
        let loc = info.location();
        println!("PANIC : {} | {:?}", msg, loc);

        loop_arch_mm()
    }
}

#[cfg(not(target_os = "none"))]
mod host {
    use log::{Level, LevelFilter, Metadata, Record};

    struct StdoutLogger;

    static LOGGER: StdoutLogger = StdoutLogger;

    impl log::Log for StdoutLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                let level = match record.level() {
                    Level::Error => "ERROR",
                    Level::Warn => "WARN",
                    Level::Info => "INFO",
                    Level::Debug => "DEBUG",
                    Level::Trace => "TRACE",
                };
                println!("[{}] {}", level, record.args());
            }
        }

        fn flush(&self) {}
    }

    pub fn init_logger() {
        let level = match std::env::var("ENVKERN_LOG").as_deref() {
            Ok("trace") => LevelFilter::Trace,
            Ok("debug") => LevelFilter::Debug,
            Ok("info") => LevelFilter::Info,
            _ => LevelFilter::Warn,
        };
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    host::init_logger();
    let report = envkern::selftest::test_all();
    print!("{}", report);
    if report.contains('✗') {
        std::process::exit(1);
    }
}
