//! Connect to a gateway and print every event it publishes
//!
//! ```text
//! cargo run --example monitor -- 192.168.1.50
//! cargo run --example monitor -- 192.168.1.50 HEAT 21.5
//! ```

use intesisbox_wmp::{ClientConfig, DeviceEvent, IntesisBox, Mode, WmpError};
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut args = env::args().skip(1);
    let Some(host) = args.next() else {
        eprintln!("usage: monitor <host> [mode] [setpoint]");
        std::process::exit(2);
    };
    let mode: Option<Mode> = args.next().map(|m| m.parse()).transpose()?;
    let setpoint: Option<f32> = args.next().map(|t| t.parse()).transpose()?;

    let ac = IntesisBox::new(ClientConfig::new(host))?;
    let mut events = ac.subscribe();
    ac.connect().await?;

    println!(
        "{} ({}) firmware {}",
        ac.model().unwrap_or_default(),
        ac.mac_address().unwrap_or_default(),
        ac.firmware_version().unwrap_or_default()
    );
    for descriptor in ac.descriptors() {
        println!("  {} {:?}", descriptor.id, descriptor.allowed);
    }

    if let Some(mode) = mode {
        ac.set_mode(mode).await?;
    }
    if let Some(setpoint) = setpoint {
        ac.set_temperature(setpoint).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(DeviceEvent::StateChanged { function, old, new }) => match old {
                    Some(old) => println!("{} {} -> {}", function, old, new),
                    None => println!("{} = {}", function, new),
                },
                Ok(DeviceEvent::ReconnectScheduled { attempt, delay }) => {
                    println!("reconnecting in {:?} (attempt {})", delay, attempt);
                }
                Ok(DeviceEvent::Fault(reason)) => println!("fault: {}", reason),
                Ok(other) => println!("{:?}", other),
                Err(WmpError::Lagged(n)) => println!("missed {} events", n),
                Err(_) => break,
            },
        }
    }

    ac.disconnect().await;
    Ok(())
}
