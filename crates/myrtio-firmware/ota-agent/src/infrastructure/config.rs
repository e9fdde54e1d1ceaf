#![allow(clippy::unreadable_literal)]

use embassy_time::Duration;

pub(crate) struct WifiConfig {
    pub ssid: &'static str,
    pub password: &'static str,
}

pub(crate) struct DeviceConfig {
    pub hostname: &'static str,
}

pub(crate) struct FirmwareConfig {
    /// Version token of this build
    pub version: &'static str,
    /// Plain `http://` only, the TCP connector carries no TLS
    pub version_url: &'static str,
    /// Plain `http://` only, same as `version_url`
    pub firmware_url: &'static str,
    pub poll_interval: Duration,
    pub version_timeout: Duration,
    pub download_timeout: Duration,
}

pub(crate) struct StorageConfig {
    /// Flash address of the `boot_rec` partition (see partitions.csv)
    pub boot_record_offset: u32,
    pub boot_record_size: u32,
}

pub(crate) struct BlinkConfig {
    pub period: Duration,
}

pub(crate) const WIFI: WifiConfig = WifiConfig {
    ssid: env!("WIFI_SSID"),
    password: env!("WIFI_PASSWORD"),
};

pub(crate) const DEVICE: DeviceConfig = DeviceConfig {
    hostname: "myrtio-ota-agent",
};

pub(crate) const FIRMWARE: FirmwareConfig = FirmwareConfig {
    version: env!("BUILD_VERSION"),
    // https:// endpoints need a plain HTTP mirror
    version_url: env!("OTA_VERSION_URL"),
    firmware_url: env!("OTA_FIRMWARE_URL"),
    poll_interval: Duration::from_secs(30),
    version_timeout: Duration::from_secs(30),
    download_timeout: Duration::from_secs(60),
};

pub(crate) const STORAGE: StorageConfig = StorageConfig {
    boot_record_offset: 0x310000,
    boot_record_size: 0x2000,
};

pub(crate) const BLINK: BlinkConfig = BlinkConfig {
    period: Duration::from_millis(1000),
};
