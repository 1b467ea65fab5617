mod support;

use intesisbox_wmp::{IntesisBox, Mode, WmpError};
use support::{wait_until, Emulator};

#[tokio::test]
async fn capabilities_come_from_discovered_limits() {
    let emulator = Emulator::start().await;
    let ac = IntesisBox::open(emulator.config()).await.unwrap();

    assert_eq!(ac.min_setpoint(), Some(16.0));
    assert_eq!(ac.max_setpoint(), Some(30.0));
    assert_eq!(
        ac.operation_list(),
        vec![Mode::Auto, Mode::Heat, Mode::Dry, Mode::Cool, Mode::Fan]
    );
    assert_eq!(ac.fan_speed_list(), vec!["AUTO", "1", "2", "3", "4"]);
    assert!(ac.has_swing_control());
    assert_eq!(ac.model().as_deref(), Some("IS-IR-WMP-1"));
    assert_eq!(ac.mac_address().as_deref(), Some("001DC9A2C911"));
    assert_eq!(ac.firmware_version().as_deref(), Some("v1.0.7"));
}

#[tokio::test]
async fn readings_are_converted_from_tenths() {
    let emulator = Emulator::start().await;
    let ac = IntesisBox::open(emulator.config()).await.unwrap();
    wait_until("state is seeded", || ac.state().len() == 9).await;

    assert_eq!(ac.setpoint(), Some(21.0));
    assert_eq!(ac.ambient_temperature(), Some(18.0));
    assert_eq!(ac.mode(), Some(Mode::Auto));
    assert!(ac.is_on());
    assert_eq!(ac.error_status().as_deref(), Some("OK"));
    assert_eq!(ac.error_code(), None);
}

#[tokio::test]
async fn set_temperature_sends_tenths() {
    let emulator = Emulator::start().await;
    let ac = IntesisBox::open(emulator.config()).await.unwrap();

    ac.set_temperature(22.5).await.unwrap();

    assert_eq!(emulator.count("SET,1:SETPTEMP,225"), 1);
    wait_until("setpoint updates", || ac.setpoint() == Some(22.5)).await;
}

#[tokio::test]
async fn set_temperature_outside_limits_is_refused() {
    let emulator = Emulator::start().await;
    let ac = IntesisBox::open(emulator.config()).await.unwrap();

    let err = ac.set_temperature(35.0).await.unwrap_err();
    assert!(matches!(err, WmpError::InvalidValue { .. }), "got {err:?}");
    let err = ac.set_temperature(f32::NAN).await.unwrap_err();
    assert!(matches!(err, WmpError::InvalidValue { .. }), "got {err:?}");
}

#[tokio::test]
async fn set_mode_on_a_powered_unit_leaves_power_alone() {
    let emulator = Emulator::start().await;
    let ac = IntesisBox::open(emulator.config()).await.unwrap();
    wait_until("power state is known", || ac.is_on()).await;

    ac.set_mode(Mode::Cool).await.unwrap();

    assert_eq!(emulator.device_value("MODE").as_deref(), Some("COOL"));
    assert_eq!(emulator.count("SET,1:ONOFF,ON"), 0);
    assert_eq!(emulator.count("GET,1:MODE"), 0);
}

#[tokio::test]
async fn set_mode_powers_on_after_confirming_the_mode() {
    let emulator = Emulator::start().await;
    let ac = IntesisBox::open(emulator.config()).await.unwrap();
    ac.set_power(false).await.unwrap();
    wait_until("unit is off", || !ac.is_on()).await;

    ac.set_mode(Mode::Heat).await.unwrap();

    let sequence: Vec<String> = emulator
        .received()
        .into_iter()
        .skip_while(|l| l != "SET,1:MODE,HEAT")
        .filter(|l| l.starts_with("SET") || l.starts_with("GET,1:MODE"))
        .collect();
    assert_eq!(
        sequence,
        vec!["SET,1:MODE,HEAT", "GET,1:MODE", "SET,1:ONOFF,ON"]
    );
    assert_eq!(emulator.device_value("ONOFF").as_deref(), Some("ON"));
}

#[tokio::test]
async fn vanes_and_fan_write_through() {
    let emulator = Emulator::start().await;
    let ac = IntesisBox::open(emulator.config()).await.unwrap();

    ac.set_fan_speed("4").await.unwrap();
    ac.set_vertical_vane("SWING").await.unwrap();
    ac.set_horizontal_vane("2").await.unwrap();

    wait_until("fan and vanes update", || {
        ac.fan_speed().as_deref() == Some("4")
            && ac.vertical_vane().as_deref() == Some("SWING")
            && ac.horizontal_vane().as_deref() == Some("2")
    })
    .await;
}
