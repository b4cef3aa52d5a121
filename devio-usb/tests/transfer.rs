use devio_usb::{Context, Error, SetupPacket, Transfer, TransferStatus, UsbContext};

#[test]
fn idle_transfer_waits_immediately() {
    let ctx = Context::new().unwrap();
    let usb = UsbContext::new(&ctx).unwrap();
    let transfer = Transfer::new(&usb).unwrap();
    transfer.wait().unwrap();
    assert_eq!(transfer.status(), TransferStatus::Completed);
    assert_eq!(transfer.actual_length(), 0);
}

#[test]
fn submit_without_a_handle_is_invalid() {
    let ctx = Context::new().unwrap();
    let usb = UsbContext::new(&ctx).unwrap();
    let transfer = Transfer::new(&usb).unwrap();
    assert!(matches!(transfer.submit(), Err(Error::InvalidParam)));
}

#[test]
fn cancel_of_unsubmitted_transfer_is_a_no_op() {
    let ctx = Context::new().unwrap();
    let usb = UsbContext::new(&ctx).unwrap();
    let transfer = Transfer::new(&usb).unwrap();
    transfer.cancel().unwrap();
    transfer.cancel().unwrap();
}

#[test]
fn user_data_round_trips() {
    let ctx = Context::new().unwrap();
    let usb = UsbContext::new(&ctx).unwrap();
    let transfer = Transfer::new(&usb).unwrap();
    transfer.set_user_data(Box::new("payload".to_string()));
    let data = transfer.take_user_data().unwrap();
    assert_eq!(*data.downcast::<String>().unwrap(), "payload");
}

#[test]
fn setup_packet_matches_get_descriptor_wire_format() {
    // GET_DESCRIPTOR for the device descriptor, 18 bytes.
    let setup = SetupPacket {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0x0000,
        length: 0x0012,
    };
    let mut buf = [0u8; 26];
    setup.write(&mut buf);
    assert_eq!(&buf[..8], &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);

    let parsed = SetupPacket::parse(&buf).unwrap();
    assert_eq!(parsed, setup);
    assert!(parsed.is_in());
    // The data stage fits behind the setup prefix.
    assert!(parsed.length as usize <= buf.len() - 8);
}

#[test]
fn enumeration_survives_a_deviceless_host() {
    let ctx = Context::new().unwrap();
    let usb = UsbContext::new(&ctx).unwrap();
    // With no usb filesystem the snapshot is empty rather than an error.
    let first = usb.devices().unwrap();
    let second = usb.devices().unwrap();
    assert_eq!(first.len(), second.len());
}
