//! Relay output and button inputs on Raspberry Pi GPIO.
use std::sync::Arc;

use grinder_traits::{BoxError, ButtonId, ButtonInput, EdgeSink, Relay, TimeBase};
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use tracing::{debug, info};

use crate::error::{HwError, Result};

pub struct GpioRelay {
    pin: OutputPin,
    active_low: bool,
}

impl GpioRelay {
    pub fn open(pin: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(format!("open relay: {e}")))?;
        let mut out = gpio
            .get(pin)
            .map_err(|e| HwError::Gpio(format!("open relay pin {pin}: {e}")))?
            .into_output();
        // Start de-energized.
        if active_low {
            out.set_high();
        } else {
            out.set_low();
        }
        info!(pin, active_low, "relay ready");
        Ok(Self {
            pin: out,
            active_low,
        })
    }
}

impl Relay for GpioRelay {
    fn set(&mut self, on: bool) -> std::result::Result<(), BoxError> {
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        debug!(on, "relay");
        Ok(())
    }
}

impl Drop for GpioRelay {
    fn drop(&mut self) {
        let _ = self.set(false);
    }
}

pub struct ButtonPins {
    pub left: u8,
    pub right: u8,
    pub back: u8,
    pub active_low: bool,
}

/// Three push buttons. Edges are delivered from rppal's interrupt thread.
pub struct GpioButtons {
    left: InputPin,
    right: InputPin,
    back: InputPin,
    active_low: bool,
}

impl GpioButtons {
    pub fn open(pins: &ButtonPins) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(format!("open buttons: {e}")))?;
        let get = |n: u8| -> Result<InputPin> {
            let pin = gpio
                .get(n)
                .map_err(|e| HwError::Gpio(format!("open button pin {n}: {e}")))?;
            Ok(if pins.active_low {
                pin.into_input_pullup()
            } else {
                pin.into_input_pulldown()
            })
        };
        Ok(Self {
            left: get(pins.left)?,
            right: get(pins.right)?,
            back: get(pins.back)?,
            active_low: pins.active_low,
        })
    }

    fn pin(&self, button: ButtonId) -> Option<&InputPin> {
        match button {
            ButtonId::Left => Some(&self.left),
            ButtonId::Right => Some(&self.right),
            ButtonId::Back => Some(&self.back),
            ButtonId::None => None,
        }
    }

    /// Route press edges of all three buttons into `sink`.
    pub fn listen(&mut self, sink: Arc<dyn EdgeSink>, time: &TimeBase) -> Result<()> {
        let trigger = if self.active_low {
            Trigger::FallingEdge
        } else {
            Trigger::RisingEdge
        };
        for (button, pin) in [
            (ButtonId::Left, &mut self.left),
            (ButtonId::Right, &mut self.right),
            (ButtonId::Back, &mut self.back),
        ] {
            let sink = Arc::clone(&sink);
            let time = time.clone();
            pin.set_async_interrupt(trigger, move |_level: Level| {
                sink.on_edge(button, time.now_ms());
            })
            .map_err(|e| HwError::Gpio(format!("button {} interrupt: {e}", button.name())))?;
        }
        info!("button interrupts armed");
        Ok(())
    }
}

impl ButtonInput for GpioButtons {
    fn is_pressed(&self, button: ButtonId) -> bool {
        self.pin(button)
            .is_some_and(|p| if self.active_low { p.is_low() } else { p.is_high() })
    }
}
