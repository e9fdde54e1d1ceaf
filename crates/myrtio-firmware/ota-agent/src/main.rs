//! OTA agent firmware
//!
//! Blinks the status LED and keeps the application partitions up to date
//! from an HTTP server.

#![no_std]
#![no_main]

mod infrastructure;

use embassy_executor::Spawner;
use embassy_time::Duration;
use esp_alloc as _;
use esp_backtrace as _;
use esp_hal::{clock::CpuClock, timer::timg::TimerGroup};
use esp_println::println;

use crate::infrastructure::{
    config,
    drivers::{init_flash_storage_mutex, init_network_stack},
    services::OtaService,
    tasks::{blink_task, network_runner_task, ota_task, wifi_connection_task},
};

esp_bootloader_esp_idf::esp_app_desc!();

#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    esp_println::logger::init_logger_from_env();

    println!("=================================");
    println!("  MyrtIO OTA agent {}", config::FIRMWARE.version);
    println!("=================================");

    // Initialize hardware
    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // Wi-Fi driver needs a heap
    esp_alloc::heap_allocator!(
        #[unsafe(link_section = ".dram2_uninit")] size: 64 * 1024
    );

    // Start rtos
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    // Foreground unit, yields to the update task at every await
    spawner.spawn(blink_task(peripherals.GPIO2)).ok();

    let flash = init_flash_storage_mutex(peripherals.FLASH);
    let ota = OtaService::new(flash);
    ota.handle_boot_state();

    // Initialize network stack and spawn network tasks
    let (stack, runner, controller) = init_network_stack(peripherals.WIFI);
    spawner.spawn(wifi_connection_task(controller)).ok();
    spawner.spawn(network_runner_task(runner)).ok();

    // Wait for network connection before starting network-dependent tasks
    let ip = myrtio_core::net::wait_for_connection(stack).await;
    println!("network: got address {}", ip.address);

    spawner.spawn(ota_task(stack, ota)).ok();

    loop {
        embassy_time::Timer::after(Duration::from_secs(5)).await;
    }
}
