use std::time::Duration;

use grinder_traits::{BoxError, Scale};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use tracing::{debug, trace};

use crate::error::{HwError, Result};
use crate::util::{sign_extend_24, wait_until_low_with_timeout};

/// Bit-banged HX711 24-bit load-cell ADC.
pub struct Hx711 {
    dt: InputPin,
    sck: OutputPin,
    gain_pulses: u8, // 1 = A/128, 2 = B/32, 3 = A/64
}

impl Hx711 {
    pub fn open(dt_pin: u8, sck_pin: u8, gain_pulses: u8) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(format!("open hx711: {e}")))?;
        let dt = gpio
            .get(dt_pin)
            .map_err(|e| HwError::Gpio(format!("open hx711 DT pin {dt_pin}: {e}")))?
            .into_input();
        let mut sck = gpio
            .get(sck_pin)
            .map_err(|e| HwError::Gpio(format!("open hx711 SCK pin {sck_pin}: {e}")))?
            .into_output();
        sck.set_low(); // clock idle low
        debug!(dt_pin, sck_pin, gain_pulses, "hx711 opened");
        Ok(Self {
            dt,
            sck,
            gain_pulses: gain_pulses.clamp(1, 3),
        })
    }

    fn pulse(&mut self) {
        self.sck.set_high();
        std::hint::spin_loop();
        self.sck.set_low();
        std::hint::spin_loop();
    }

    pub fn read_with_timeout(&mut self, timeout: Duration) -> Result<i32> {
        let dt = &self.dt;
        wait_until_low_with_timeout(|| dt.is_high(), timeout, Duration::from_micros(200))?;

        let mut value: u32 = 0;
        for _ in 0..24 {
            self.sck.set_high();
            std::hint::spin_loop();
            value = (value << 1) | u32::from(self.dt.is_high());
            self.sck.set_low();
            std::hint::spin_loop();
        }
        // Extra pulses select gain/channel for the next conversion.
        for _ in 0..self.gain_pulses {
            self.pulse();
        }

        let raw = sign_extend_24(value);
        trace!(raw, "hx711 raw read");
        Ok(raw)
    }
}

impl Scale for Hx711 {
    fn read(&mut self, timeout: Duration) -> std::result::Result<i32, BoxError> {
        self.read_with_timeout(timeout).map_err(Into::into)
    }
}
