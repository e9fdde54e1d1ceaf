use embassy_time::Timer;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::peripherals::GPIO2;

use crate::infrastructure::config;

/// Status LED, shares the executor with the update task.
#[embassy_executor::task]
pub(crate) async fn blink_task(gpio: GPIO2<'static>) {
    let mut pin = Output::new(gpio, Level::High, OutputConfig::default());
    loop {
        pin.set_high();
        Timer::after(config::BLINK.period).await;
        pin.set_low();
        Timer::after(config::BLINK.period).await;
    }
}
