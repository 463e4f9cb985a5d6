use pnhv::{BootConfig, System};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = BootConfig {
        core_count: 4,
        total_memory_bytes: 1024 * 1024 * 1024,
        ramdisk_len: 0,
        known_devices: vec!["eth0".to_string()],
    };

    System::boot(config)?.run()
}
