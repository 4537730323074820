#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lens_driver::sim::{Faults, SimHandle, SimulatedLens};
    use lens_driver::{ErrorKind, LensConfig, LensDriver, LensError, LensMode};

    fn config() -> LensConfig {
        LensConfig::default().with_close_ramp(Duration::ZERO, 5)
    }

    fn open() -> (LensDriver, SimHandle) {
        let sim = SimulatedLens::new();
        let handle = sim.handle();
        let driver = LensDriver::from_transport(Box::new(sim), config()).unwrap();
        (driver, handle)
    }

    #[test]
    fn test_temperature_reading() {
        let (mut driver, sim) = open();
        sim.set_temperature(36.25);
        let temp = driver.get_temperature().unwrap();
        assert!(temp.is_finite());
        assert!(temp > -40.0 && temp < 125.0);
        assert_eq!(temp, 36.25);
    }

    #[test]
    fn test_current_mode_then_set_current() {
        let (mut driver, sim) = open();
        assert_eq!(driver.set_mode(LensMode::Current).unwrap(), None);
        driver.set_current(50.0).unwrap();
        assert_eq!(sim.mode(), 1);
        assert!((sim.current() - 50.0).abs() < 0.1);
        assert!((driver.get_current().unwrap() - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_focal_power_range_is_ordered() {
        let (mut driver, sim) = open();
        sim.set_focal_range(-1.5, 3.5);
        let range = driver
            .set_mode(LensMode::FocalPower)
            .unwrap()
            .expect("simulated lens reports a range");
        assert!(range.min <= range.max);
        assert!((range.min + 1.5).abs() < 1e-9);
        assert!((range.max - 3.5).abs() < 1e-9);
        assert_eq!(sim.mode(), 5);
    }

    #[test]
    fn test_inverted_focal_range_is_not_reported() {
        let (mut driver, sim) = open();
        sim.set_faults(Faults {
            inverted_focal_range: true,
            ..Faults::default()
        });
        assert_eq!(driver.set_mode(LensMode::FocalPower).unwrap(), None);
        assert_eq!(driver.mode(), Some(LensMode::FocalPower));
    }

    #[test]
    fn test_unknown_mode_name_is_rejected() {
        let (mut driver, sim) = open();
        let commands_before = sim.commands().len();
        let err = driver.set_mode_str("unsupported_mode_name").unwrap_err();
        assert!(matches!(err, LensError::InvalidMode(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
        assert_eq!(sim.commands().len(), commands_before);
    }

    #[test]
    fn test_position_mode_cannot_be_commanded() {
        let (mut driver, _sim) = open();
        let err = driver.set_mode(LensMode::Position).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMode);
    }

    #[test]
    fn test_mode_names_drive_the_device() {
        let (mut driver, sim) = open();
        assert!(driver.set_mode_str("focal_power").unwrap().is_some());
        assert_eq!(sim.mode(), 5);
        assert_eq!(driver.set_mode_str("sinusoidal").unwrap(), None);
        assert_eq!(sim.mode(), 2);
        assert_eq!(driver.focal_range(), None);
    }

    #[test]
    fn test_set_current_requires_current_mode() {
        // The simulated device starts in current mode, but the session has
        // not commanded it yet.
        let (mut driver, sim) = open();
        assert_eq!(sim.mode(), 1);
        let err = driver.set_current(50.0).unwrap_err();
        assert!(matches!(
            err,
            LensError::WrongMode {
                expected: LensMode::Current,
                actual: None
            }
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        driver.set_mode(LensMode::FocalPower).unwrap();
        assert_eq!(driver.set_current(50.0).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_set_current_rejects_values_beyond_max() {
        let (mut driver, _sim) = open();
        driver.set_mode(LensMode::Current).unwrap();
        let err = driver.set_current(400.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(driver.set_current(f64::NAN).unwrap_err().kind(), ErrorKind::InvalidArgument);
        driver.set_current(-200.0).unwrap();
    }

    #[test]
    fn test_diopter_round_trip_for_both_firmware_types() {
        for firmware in [b'A', b'B'] {
            let sim = SimulatedLens::new();
            let handle = sim.handle();
            handle.set_firmware_type(firmware);
            let mut driver = LensDriver::from_transport(Box::new(sim), config()).unwrap();

            driver.set_mode(LensMode::FocalPower).unwrap();
            driver.set_diopter(2.5).unwrap();
            assert!((handle.diopter() - 2.5).abs() < 0.01);
            assert!((driver.get_diopter().unwrap() - 2.5).abs() < 0.01);
        }
    }

    #[test]
    fn test_set_diopter_outside_range_is_rejected() {
        let (mut driver, sim) = open();
        sim.set_focal_range(-2.0, 3.0);
        driver.set_mode(LensMode::FocalPower).unwrap();
        let err = driver.set_diopter(4.0).unwrap_err();
        assert!(matches!(err, LensError::OutOfRange { what: "focal power", .. }));
    }

    #[test]
    fn test_set_diopter_after_refresh_mode_stays_within_wire_range() {
        let (mut driver, sim) = open();
        sim.set_mode(5);
        assert_eq!(driver.refresh_mode().unwrap(), Some(LensMode::FocalPower));
        assert_eq!(driver.focal_range(), None);

        let sent = sim.commands().len();
        let err = driver.set_diopter(200.0).unwrap_err();
        assert!(matches!(err, LensError::OutOfRange { what: "focal power", .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(sim.commands().len(), sent);

        driver.set_diopter(150.0).unwrap();
        assert!((sim.diopter() - 150.0).abs() < 0.01);
    }

    #[test]
    fn test_session_closes_exactly_once() {
        let sim = SimulatedLens::new();
        let handle = sim.handle();
        {
            let mut driver = LensDriver::from_transport(Box::new(sim), config()).unwrap();
            driver.get_temperature().unwrap();
            assert_eq!(handle.closed_count(), 0);
        }
        assert_eq!(handle.closed_count(), 1);
    }

    #[test]
    fn test_scope_closes_after_error() {
        let sim = SimulatedLens::new();
        let handle = sim.handle();
        let driver = LensDriver::from_transport(Box::new(sim), config()).unwrap();

        let result = driver.scope(|lens| {
            lens.set_mode(LensMode::Current)?;
            lens.set_current(75.0)?;
            lens.set_mode_str("warp_drive")?;
            lens.set_current(10.0)
        });

        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidMode);
        assert_eq!(handle.closed_count(), 1);
        // Soft close brought the output back down.
        assert_eq!(handle.current(), 0.0);
    }

    #[test]
    fn test_explicit_close_then_drop_closes_once() {
        let (mut driver, sim) = open();
        driver.set_mode(LensMode::Current).unwrap();
        driver.close().unwrap();
        assert_eq!(sim.closed_count(), 1);
    }

    #[test]
    fn test_failed_handshake_releases_transport() {
        let sim = SimulatedLens::new();
        let handle = sim.handle();
        handle.set_faults(Faults {
            reject_handshake: true,
            ..Faults::default()
        });
        let err = match LensDriver::from_transport(Box::new(sim), config()) {
            Ok(_) => panic!("handshake should have been rejected"),
            Err(e) => e,
        };
        assert!(matches!(err, LensError::HandshakeFailed(ref reply) if reply == b"Busy!\r\n"));
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(handle.closed_count(), 1);
    }

    #[test]
    fn test_silent_device_is_a_connection_error_at_open() {
        let sim = SimulatedLens::new();
        let handle = sim.handle();
        handle.set_faults(Faults {
            silent: true,
            ..Faults::default()
        });
        let err = match LensDriver::from_transport(Box::new(sim), config()) {
            Ok(_) => panic!("silent device should not open"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_silent_device_is_a_communication_error_later() {
        let (mut driver, sim) = open();
        sim.set_faults(Faults {
            silent: true,
            ..Faults::default()
        });
        let err = driver.get_temperature().unwrap_err();
        assert!(matches!(err, LensError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Communication);
    }

    #[test]
    fn test_corrupt_crc_is_detected() {
        let (mut driver, sim) = open();
        sim.set_faults(Faults {
            corrupt_crc: true,
            ..Faults::default()
        });
        let err = driver.get_temperature().unwrap_err();
        assert!(matches!(err, LensError::CrcError));
        assert_eq!(err.kind(), ErrorKind::Communication);
    }

    #[test]
    fn test_device_info() {
        let (mut driver, _sim) = open();
        assert_eq!(driver.firmware_type(), "A");
        assert_eq!(driver.firmware_version(), (1, 2, 3, 4));
        assert_eq!(driver.firmware_branch().unwrap(), 1);
        assert_eq!(driver.part_number().unwrap(), b"LD4".to_vec());
        assert_eq!(driver.serial_number().unwrap(), "SIM00001");
        assert_eq!(driver.device_id().unwrap(), b"SIMLENS1".to_vec());
    }

    #[test]
    fn test_current_limits() {
        let (mut driver, _sim) = open();
        let upper = driver.set_current_upper_limit(200.0).unwrap();
        let lower = driver.set_current_lower_limit(-200.0).unwrap();
        assert!((upper - 200.0).abs() < 0.1);
        assert!((lower + 200.0).abs() < 0.1);
        assert!((driver.current_upper_limit().unwrap() - 200.0).abs() < 0.1);
        assert!((driver.current_lower_limit().unwrap() + 200.0).abs() < 0.1);

        let err = driver.set_current_upper_limit(300.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_max_output_current() {
        let (mut driver, sim) = open();
        assert!((driver.set_max_output_current(200.0).unwrap() - 200.0).abs() < 1e-9);
        assert!((driver.max_output_current() - 200.0).abs() < 1e-9);

        driver.set_mode(LensMode::Current).unwrap();
        driver.set_current(100.0).unwrap();
        assert!((sim.current() - 100.0).abs() < 0.1);

        let err = driver.set_max_output_current(300.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_signal_generator() {
        let (mut driver, _sim) = open();
        driver.set_signal_upper(100.0).unwrap();
        driver.set_signal_lower(-100.0).unwrap();
        driver.set_signal_frequency(10.0).unwrap();

        assert!((driver.signal_upper().unwrap() - 100.0).abs() < 0.1);
        assert!((driver.signal_lower().unwrap() + 100.0).abs() < 0.1);
        assert!((driver.signal_frequency().unwrap() - 10.0).abs() < 1e-9);

        assert_eq!(
            driver.set_signal_frequency(-1.0).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_temperature_limits() {
        let (mut driver, sim) = open();
        sim.set_focal_range(-1.0, 2.0);
        let range = driver.set_temperature_limits(20.0, 30.0).unwrap();
        assert!(range.min <= range.max);
        assert!((range.max - 2.0).abs() < 1e-9);
        assert_eq!(sim.temperature_limits(), (20.0, 30.0));

        let err = driver.set_temperature_limits(30.0, 20.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_temperature_limits_beyond_wire_range_are_rejected() {
        let (mut driver, sim) = open();
        let sent = sim.commands().len();
        let err = driver.set_temperature_limits(20.0, 3000.0).unwrap_err();
        assert!(matches!(err, LensError::OutOfRange { what: "temperature limit", .. }));
        assert_eq!(sim.commands().len(), sent);
        assert_eq!(sim.temperature_limits(), (0.0, 0.0));
    }

    #[test]
    fn test_temperature_limits_read_back() {
        let (mut driver, _sim) = open();
        driver.set_temperature_limits(20.0, 30.0).unwrap();
        assert_eq!(driver.temperature_limits().unwrap(), (20.0, 30.0));
    }

    #[test]
    fn test_gain() {
        let (mut driver, sim) = open();
        sim.set_focal_range(-1.0, 2.0);
        let range = driver.set_gain(2.5).unwrap().expect("simulated lens reports a range");
        assert!((range.min + 1.0).abs() < 1e-9);
        assert!((range.max - 2.0).abs() < 1e-9);
        assert_eq!(sim.gain(), 2.5);
        assert_eq!(driver.gain().unwrap(), 2.5);

        for bad in [-0.5, 5.5, f64::NAN] {
            assert_eq!(driver.set_gain(bad).unwrap_err().kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(driver.gain().unwrap(), 2.5);
    }

    #[test]
    fn test_gain_updates_focal_range_in_focal_power_mode() {
        let (mut driver, sim) = open();
        driver.set_mode(LensMode::FocalPower).unwrap();
        sim.set_focal_range(-0.5, 1.0);
        driver.set_gain(1.5).unwrap();
        let range: (f64, f64) = driver.focal_range().expect("range from gain reply").into();
        assert_eq!(range, (-0.5, 1.0));
        assert!(driver.set_diopter(1.5).is_err());
    }

    #[test]
    fn test_commands_carry_valid_crc() {
        let (mut driver, sim) = open();
        driver.get_temperature().unwrap();
        let commands = sim.commands();
        assert_eq!(commands[0], b"Start".to_vec());
        assert_eq!(commands.last().unwrap(), &b"TCA".to_vec());
    }
}
