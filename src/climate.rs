//! Climate controls on top of [`IntesisBox::set_value`] / [`IntesisBox::get_value`]
//!
//! Temperatures are exchanged with the gateway in tenths of a degree Celsius
//! and exposed here in degrees.

use crate::client::IntesisBox;
use crate::error::{Result, WmpError};
use crate::types::{
    AllowedValues, Mode, Value, FUNCTION_AMBTEMP, FUNCTION_ERRCODE, FUNCTION_ERRSTATUS,
    FUNCTION_FANSP, FUNCTION_MODE, FUNCTION_ONOFF, FUNCTION_SETPOINT, FUNCTION_VANELR,
    FUNCTION_VANEUD, POWER_OFF, POWER_ON,
};
use std::time::Duration;

/// Mode reads before giving up on powering on after a mode change
const MODE_CONFIRM_ATTEMPTS: u32 = 10;
const MODE_CONFIRM_INTERVAL: Duration = Duration::from_millis(500);

impl IntesisBox {
    // ========== Power ==========

    /// Switch the unit on or off
    pub async fn set_power(&self, on: bool) -> Result<()> {
        self.set_value(FUNCTION_ONOFF, if on { POWER_ON } else { POWER_OFF })
            .await
    }

    /// Whether the last known `ONOFF` value is `ON`
    pub fn is_on(&self) -> bool {
        self.text(FUNCTION_ONOFF).as_deref() == Some(POWER_ON)
    }

    // ========== Mode ==========

    /// Change the operating mode, powering the unit on if it is off
    ///
    /// Some units apply commands out of order, so when the unit is off the
    /// new mode is read back before `ONOFF,ON` is sent.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        tracing::debug!("Setting MODE to {}", mode);
        self.set_value(FUNCTION_MODE, mode.as_str()).await?;
        if self.is_on() {
            return Ok(());
        }

        for attempt in 1..=MODE_CONFIRM_ATTEMPTS {
            match self.get_value(FUNCTION_MODE).await {
                Ok(Value::Enumerated(current)) if current == mode.as_str() => {
                    tracing::debug!("MODE confirmed as {}, powering on", mode);
                    return self.set_power(true).await;
                }
                Ok(current) => {
                    tracing::debug!(
                        "Waiting for MODE {}, currently {} (attempt {})",
                        mode,
                        current,
                        attempt
                    );
                }
                Err(WmpError::Timeout) => {
                    tracing::debug!("MODE read timed out (attempt {})", attempt);
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(MODE_CONFIRM_INTERVAL).await;
        }

        tracing::error!("Cannot confirm MODE {}, not powering on", mode);
        Err(WmpError::Timeout)
    }

    /// Current operating mode, if known and recognised
    pub fn mode(&self) -> Option<Mode> {
        self.text(FUNCTION_MODE)?.parse().ok()
    }

    /// Modes the unit reported in its limits
    pub fn operation_list(&self) -> Vec<Mode> {
        self.options(FUNCTION_MODE)
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect()
    }

    // ========== Temperature ==========

    /// Set the target temperature in °C
    pub async fn set_temperature(&self, celsius: f32) -> Result<()> {
        let tenths = (celsius * 10.0).round();
        if !tenths.is_finite() || tenths.abs() > i32::MAX as f32 {
            return Err(WmpError::InvalidValue {
                function: self.function_id(FUNCTION_SETPOINT).to_string(),
                value: celsius.to_string(),
                detail: "not a temperature".to_string(),
            });
        }
        self.set_value(FUNCTION_SETPOINT, (tenths as i32).to_string())
            .await
    }

    /// Target temperature in °C
    pub fn setpoint(&self) -> Option<f32> {
        self.tenths(FUNCTION_SETPOINT)
    }

    /// Room temperature in °C
    pub fn ambient_temperature(&self) -> Option<f32> {
        self.tenths(FUNCTION_AMBTEMP)
    }

    /// Lowest accepted setpoint in °C, from the discovered limits
    pub fn min_setpoint(&self) -> Option<f32> {
        self.setpoint_range().map(|(min, _)| min as f32 / 10.0)
    }

    /// Highest accepted setpoint in °C, from the discovered limits
    pub fn max_setpoint(&self) -> Option<f32> {
        self.setpoint_range().map(|(_, max)| max as f32 / 10.0)
    }

    // ========== Fan and vanes ==========

    /// Set the fan speed to one of [`fan_speed_list`](Self::fan_speed_list)
    pub async fn set_fan_speed(&self, speed: &str) -> Result<()> {
        self.set_value(FUNCTION_FANSP, speed).await
    }

    /// Current fan speed token
    pub fn fan_speed(&self) -> Option<String> {
        self.text(FUNCTION_FANSP)
    }

    /// Fan speeds the unit reported in its limits
    pub fn fan_speed_list(&self) -> Vec<String> {
        self.options(FUNCTION_FANSP)
    }

    /// Move the up/down vane, or pass `SWING` to oscillate
    pub async fn set_vertical_vane(&self, position: &str) -> Result<()> {
        self.set_value(FUNCTION_VANEUD, position).await
    }

    /// Current up/down vane position
    pub fn vertical_vane(&self) -> Option<String> {
        self.text(FUNCTION_VANEUD)
    }

    /// Up/down vane positions the unit reported in its limits
    pub fn vertical_vane_list(&self) -> Vec<String> {
        self.options(FUNCTION_VANEUD)
    }

    /// Move the left/right vane, or pass `SWING` to oscillate
    pub async fn set_horizontal_vane(&self, position: &str) -> Result<()> {
        self.set_value(FUNCTION_VANELR, position).await
    }

    /// Current left/right vane position
    pub fn horizontal_vane(&self) -> Option<String> {
        self.text(FUNCTION_VANELR)
    }

    /// Left/right vane positions the unit reported in its limits
    pub fn horizontal_vane_list(&self) -> Vec<String> {
        self.options(FUNCTION_VANELR)
    }

    /// Whether either vane has more than one position
    pub fn has_swing_control(&self) -> bool {
        self.vertical_vane_list().len() > 1 || self.horizontal_vane_list().len() > 1
    }

    // ========== Diagnostics ==========

    /// `ERRSTATUS` as reported by the AC unit
    pub fn error_status(&self) -> Option<String> {
        self.text(FUNCTION_ERRSTATUS)
    }

    /// `ERRCODE` as reported by the AC unit, `None` when empty
    pub fn error_code(&self) -> Option<String> {
        self.text(FUNCTION_ERRCODE).filter(|code| !code.is_empty())
    }

    /// Gateway MAC address from the `ID` reply
    pub fn mac_address(&self) -> Option<String> {
        self.device_info().map(|info| info.mac)
    }

    /// Gateway model from the `ID` reply
    pub fn model(&self) -> Option<String> {
        self.device_info().map(|info| info.model)
    }

    /// Gateway firmware version from the `ID` reply
    pub fn firmware_version(&self) -> Option<String> {
        self.device_info().map(|info| info.firmware_version)
    }

    /// Wi-Fi signal strength in dBm, refreshed by every keepalive
    pub fn rssi(&self) -> Option<i32> {
        self.device_info().and_then(|info| info.rssi)
    }

    fn text(&self, function: &str) -> Option<String> {
        self.value(function)?.as_str().map(str::to_string)
    }

    fn tenths(&self, function: &str) -> Option<f32> {
        self.value(function)?
            .as_integer()
            .map(|n| n as f32 / 10.0)
    }

    fn options(&self, function: &str) -> Vec<String> {
        self.descriptor_of(function)
            .map(|d| d.options().to_vec())
            .unwrap_or_default()
    }

    fn setpoint_range(&self) -> Option<(i32, i32)> {
        match self.descriptor_of(FUNCTION_SETPOINT)?.allowed {
            AllowedValues::Range { min, max } => Some((min, max)),
            _ => None,
        }
    }
}
