//! Raspberry Pi GPIO backend built on `rppal`.
//!
//! Digital I/O and edge interrupts use the BCM header through
//! `rppal::gpio`; PWM uses the Pi's hardware PWM peripheral, available on
//! BCM 12/18 (PWM0) and BCM 13/19 (PWM1). The laser output must sit on one
//! of those four pins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use rppal::pwm::{Channel, Polarity, Pwm};
use tracing::{debug, info, warn};

use crate::gpio::{
    check_freq, clamp_duty, EdgeHandler, EdgeKind, GpioBackend, GpioError, GpioResult, Level, Pin,
    PinMode, PwmChannel, Pull,
};

fn hw(err: impl std::fmt::Display) -> GpioError {
    GpioError::HardwareFault(err.to_string())
}

fn to_rppal_trigger(edge: EdgeKind) -> Trigger {
    match edge {
        EdgeKind::Rising => Trigger::RisingEdge,
        EdgeKind::Falling => Trigger::FallingEdge,
        EdgeKind::Both => Trigger::Both,
    }
}

fn from_rppal_level(level: rppal::gpio::Level) -> Level {
    match level {
        rppal::gpio::Level::Low => Level::Low,
        rppal::gpio::Level::High => Level::High,
    }
}

enum ClaimedPin {
    Input(InputPin),
    Output(OutputPin),
}

/// GPIO backend for the Raspberry Pi header.
pub struct RpiGpio {
    gpio: Gpio,
    pins: Mutex<HashMap<Pin, ClaimedPin>>,
    /// PWM channels handed out through [`GpioBackend::pwm`]; shared with
    /// the channel handles so `cleanup` can stop them.
    pwms: Mutex<HashMap<Pin, Arc<Mutex<Pwm>>>>,
}

impl RpiGpio {
    /// Open the Pi's GPIO peripheral.
    pub fn new() -> GpioResult<Self> {
        let gpio = Gpio::new().map_err(hw)?;
        info!("opened Raspberry Pi GPIO peripheral");
        Ok(Self {
            gpio,
            pins: Mutex::new(HashMap::new()),
            pwms: Mutex::new(HashMap::new()),
        })
    }

    fn pwm_channel_for(pin: Pin) -> GpioResult<Channel> {
        match pin {
            12 | 18 => Ok(Channel::Pwm0),
            13 | 19 => Ok(Channel::Pwm1),
            _ => Err(GpioError::Unsupported(
                "hardware PWM (use BCM 12, 13, 18 or 19)",
            )),
        }
    }
}

impl GpioBackend for RpiGpio {
    fn configure(&self, pin: Pin, mode: PinMode, pull: Pull) -> GpioResult<()> {
        let mut pins = self.pins.lock().expect("pin map poisoned");
        // Re-configuring drops the previous claim first.
        pins.remove(&pin);

        let io_pin = self.gpio.get(pin).map_err(hw)?;
        let claimed = match mode {
            PinMode::Output => ClaimedPin::Output(io_pin.into_output()),
            PinMode::Input => ClaimedPin::Input(match pull {
                Pull::Up => io_pin.into_input_pullup(),
                Pull::Down => io_pin.into_input_pulldown(),
                Pull::None => io_pin.into_input(),
            }),
        };
        pins.insert(pin, claimed);
        debug!(pin, ?mode, "configured GPIO line");
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> GpioResult<()> {
        let mut pins = self.pins.lock().expect("pin map poisoned");
        match pins.get_mut(&pin) {
            Some(ClaimedPin::Output(out)) => {
                match level {
                    Level::High => out.set_high(),
                    Level::Low => out.set_low(),
                }
                Ok(())
            }
            Some(ClaimedPin::Input(_)) => Err(GpioError::InvalidArgument(format!(
                "pin {pin} is not an output"
            ))),
            None => Err(GpioError::UnconfiguredPin(pin)),
        }
    }

    fn read(&self, pin: Pin) -> GpioResult<Level> {
        let pins = self.pins.lock().expect("pin map poisoned");
        match pins.get(&pin) {
            Some(ClaimedPin::Input(input)) => Ok(from_rppal_level(input.read())),
            Some(ClaimedPin::Output(out)) => Ok(Level::from(out.is_set_high())),
            None => Err(GpioError::UnconfiguredPin(pin)),
        }
    }

    fn watch(
        &self,
        pin: Pin,
        edge: EdgeKind,
        debounce: Duration,
        handler: EdgeHandler,
    ) -> GpioResult<()> {
        let mut pins = self.pins.lock().expect("pin map poisoned");
        let Some(ClaimedPin::Input(input)) = pins.get_mut(&pin) else {
            return Err(GpioError::UnconfiguredPin(pin));
        };

        // rppal dispatches interrupts from its own thread; the suppression
        // window lives here so handlers stay flag-setting only.
        let last_accepted: Mutex<Option<Instant>> = Mutex::new(None);
        input
            .set_async_interrupt(to_rppal_trigger(edge), move |level| {
                let now = Instant::now();
                let mut last = last_accepted.lock().expect("debounce state poisoned");
                if let Some(prev) = *last {
                    if now.duration_since(prev) < debounce {
                        return;
                    }
                }
                *last = Some(now);
                handler(pin, from_rppal_level(level));
            })
            .map_err(hw)?;
        debug!(pin, ?edge, "installed edge watch");
        Ok(())
    }

    fn unwatch(&self, pin: Pin) -> GpioResult<()> {
        let mut pins = self.pins.lock().expect("pin map poisoned");
        if let Some(ClaimedPin::Input(input)) = pins.get_mut(&pin) {
            input.clear_async_interrupt().map_err(hw)?;
        }
        Ok(())
    }

    fn pwm(&self, pin: Pin, freq_hz: f64) -> GpioResult<Box<dyn PwmChannel>> {
        let freq = check_freq(freq_hz)?;
        let channel = Self::pwm_channel_for(pin)?;
        let pwm = Pwm::with_frequency(channel, freq, 0.0, Polarity::Normal, false).map_err(hw)?;
        let pwm = Arc::new(Mutex::new(pwm));
        self.pwms
            .lock()
            .expect("PWM map poisoned")
            .insert(pin, Arc::clone(&pwm));
        info!(pin, freq, "opened hardware PWM channel");
        Ok(Box::new(RpiPwm {
            pwm,
            duty_pct: 0.0,
            freq_hz: freq,
            running: false,
        }))
    }

    fn cleanup(&self, pins: &[Pin]) -> GpioResult<()> {
        let mut map = self.pins.lock().expect("pin map poisoned");
        for &pin in pins {
            match map.remove(&pin) {
                Some(ClaimedPin::Output(mut out)) => out.set_low(),
                Some(ClaimedPin::Input(mut input)) => {
                    if let Err(err) = input.clear_async_interrupt() {
                        warn!(pin, %err, "failed to clear interrupt during cleanup");
                    }
                }
                None => {}
            }
            if let Some(pwm) = self.pwms.lock().expect("PWM map poisoned").remove(&pin) {
                let pwm = pwm.lock().expect("PWM channel poisoned");
                if let Err(err) = pwm.set_duty_cycle(0.0) {
                    warn!(pin, %err, "failed to zero PWM duty during cleanup");
                }
                if let Err(err) = pwm.disable() {
                    warn!(pin, %err, "failed to disable PWM during cleanup");
                }
            }
        }
        Ok(())
    }
}

struct RpiPwm {
    pwm: Arc<Mutex<Pwm>>,
    duty_pct: f64,
    freq_hz: f64,
    running: bool,
}

impl PwmChannel for RpiPwm {
    fn start(&mut self, duty_pct: f64) -> GpioResult<()> {
        let duty = clamp_duty(duty_pct)?;
        let pwm = self.pwm.lock().expect("PWM channel poisoned");
        pwm.set_duty_cycle(duty / 100.0).map_err(hw)?;
        pwm.enable().map_err(hw)?;
        self.duty_pct = duty;
        self.running = true;
        Ok(())
    }

    fn set_duty(&mut self, duty_pct: f64) -> GpioResult<()> {
        let duty = clamp_duty(duty_pct)?;
        self.pwm
            .lock()
            .expect("PWM channel poisoned")
            .set_duty_cycle(duty / 100.0)
            .map_err(hw)?;
        self.duty_pct = duty;
        Ok(())
    }

    fn set_freq(&mut self, freq_hz: f64) -> GpioResult<()> {
        let freq = check_freq(freq_hz)?;
        self.pwm
            .lock()
            .expect("PWM channel poisoned")
            .set_frequency(freq, self.duty_pct / 100.0)
            .map_err(hw)?;
        self.freq_hz = freq;
        Ok(())
    }

    fn stop(&mut self) -> GpioResult<()> {
        let pwm = self.pwm.lock().expect("PWM channel poisoned");
        pwm.set_duty_cycle(0.0).map_err(hw)?;
        pwm.disable().map_err(hw)?;
        self.duty_pct = 0.0;
        self.running = false;
        Ok(())
    }

    fn duty(&self) -> f64 {
        if self.running {
            self.duty_pct
        } else {
            0.0
        }
    }
}
