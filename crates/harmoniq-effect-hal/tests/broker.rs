use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use harmoniq_effect_hal::{
    BrokerConfig, CommandCode, EffectBroker, EffectBuffer, EffectSession, HalError,
};

fn broker_executable() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_harmoniq-effect-broker"))
}

fn config(gain: f32) -> BrokerConfig {
    BrokerConfig {
        executable: broker_executable(),
        gain,
        name: Some("Broker Gain".into()),
        handshake_timeout: Duration::from_secs(5),
    }
}

#[test]
fn processes_audio_in_a_helper_process() {
    let broker = EffectBroker::spawn(config(0.5)).expect("spawn broker");
    let mut session = EffectSession::new(broker);
    assert_eq!(session.get_descriptor().expect("descriptor").name, "Broker Gain");

    let input = Arc::new(EffectBuffer::create(2, 256).unwrap());
    let output = Arc::new(EffectBuffer::create(2, 256).unwrap());
    session.set_in_buffer(Some(Arc::clone(&input))).unwrap();
    session.set_out_buffer(Some(Arc::clone(&output))).unwrap();

    let block: Vec<f32> = (0..512).map(|i| i as f32).collect();
    input.write_interleaved(&block).unwrap();
    session.process().expect("process");

    let mut rendered = vec![0.0f32; block.len()];
    output.read_interleaved(&mut rendered).unwrap();
    for (out, src) in rendered.iter().zip(&block) {
        assert_eq!(*out, src * 0.5);
    }

    let mut reply = [0u8; 8];
    assert_eq!(session.command(CommandCode::GET_PARAM, None, Some(&mut reply)), Ok(8));
    assert_eq!(f32::from_ne_bytes([reply[0], reply[1], reply[2], reply[3]]), 0.5);

    let mut dump = Vec::new();
    session.dump(&mut dump).unwrap();
    assert!(String::from_utf8_lossy(&dump).contains("cycles: 1"));

    assert_eq!(session.close(), Ok(()));
    assert_eq!(session.process(), Err(HalError::NotInitialized));
}

#[test]
fn missing_executable_fails_to_spawn() {
    let mut config = config(1.0);
    config.executable = PathBuf::from("/nonexistent/harmoniq-effect-broker");
    assert!(EffectBroker::spawn(config).is_err());
}

#[test]
fn shutdown_reaps_the_helper() {
    let mut broker = EffectBroker::spawn(config(1.0)).expect("spawn broker");
    broker.shutdown().expect("clean exit");
    broker.shutdown().expect("second shutdown is a no-op");
}
