use std::time::Duration;

pub const USB_VID: u16 = 0x1209;
pub const USB_PID: u16 = 0xA119;

/// USB frames per second; one packet per frame and direction.
pub const PACKETS_PER_SEC: u32 = 8000;

#[cfg(target_os = "linux")]
const DEFAULT_TRANSFERS: usize = 32;
#[cfg(target_os = "linux")]
const DEFAULT_PACKETS_PER_TRANSFER: usize = 120;
#[cfg(not(target_os = "linux"))]
const DEFAULT_TRANSFERS: usize = 16;
#[cfg(not(target_os = "linux"))]
const DEFAULT_PACKETS_PER_TRANSFER: usize = 240;

/// Transmit pacing loop parameters.
#[derive(Debug, Clone)]
pub struct RateControlConfig {
    /// Bytes added to or removed from a transfer per correction.
    pub quantum_bytes: i64,
    /// FIFO level above which transfers shrink.
    pub high_watermark: u8,
    /// FIFO level below which transfers grow.
    pub low_watermark: u8,
    /// FIFO readings ignored after the stream starts.
    pub warmup_observations: u32,
    /// FIFO readings ignored after each correction.
    pub settle_observations: u32,
    /// Completed packets between FIFO level queries.
    pub fifo_check_packets: u32,
    /// Completed packets between clock rate queries.
    pub clock_check_packets: u32,
}

impl Default for RateControlConfig {
    fn default() -> Self {
        Self {
            quantum_bytes: 1024,
            high_watermark: 0x30,
            low_watermark: 0x10,
            warmup_observations: 16,
            settle_observations: 16,
            fifo_check_packets: PACKETS_PER_SEC / 8,
            clock_check_packets: PACKETS_PER_SEC * 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub num_transfers: usize,
    pub packets_per_transfer: usize,
    /// Upper bound on a single event-loop wait.
    pub poll_interval: Duration,
    /// How long `stop` waits for in-flight transfers before cancelling them.
    pub drain_timeout: Duration,
    /// Extra bytes in the first TX transfer to pre-load the device FIFO.
    pub tx_prime_bytes: i64,
    /// RX completions thrown away after start.
    pub rx_discard_transfers: usize,
    pub rate: RateControlConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            num_transfers: DEFAULT_TRANSFERS,
            packets_per_transfer: DEFAULT_PACKETS_PER_TRANSFER,
            poll_interval: Duration::from_millis(5),
            drain_timeout: Duration::from_secs(1),
            tx_prime_bytes: 2000,
            rx_discard_transfers: 2,
            rate: RateControlConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub ep_spi_out: u8,
    pub ep_spi_in: u8,
    pub ep_data_out: u8,
    pub ep_data_in: u8,
    /// GPIO driving the FPGA SPI chip select.
    pub fpga_cs_gpio: u8,
    /// GPIO driving the MAX5863 ADC/DAC chip select.
    pub adc_dac_cs_gpio: u8,
    /// Largest relative error between a requested sample rate and the rate
    /// the divider actually produces.
    pub rate_tolerance: f64,
    pub control_timeout: Duration,
    /// Pause between board clock readings while waiting for it to settle.
    pub clock_retry_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: USB_VID,
            product_id: USB_PID,
            interface: 0,
            ep_spi_out: 0x01,
            ep_spi_in: 0x81,
            ep_data_out: 0x02,
            ep_data_in: 0x86,
            fpga_cs_gpio: 3,
            adc_dac_cs_gpio: 1,
            rate_tolerance: 0.01,
            control_timeout: Duration::from_secs(1),
            clock_retry_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_intervals_match_wall_time() {
        let rc = RateControlConfig::default();
        // 125 ms and 10 s at one packet per 125 us.
        assert_eq!(rc.fifo_check_packets, 1000);
        assert_eq!(rc.clock_check_packets, 80_000);
    }

    #[test]
    fn default_queue_depth_is_platform_specific() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.num_transfers * cfg.packets_per_transfer, 3840);
        assert_eq!(cfg.poll_interval, Duration::from_millis(5));
    }
}
