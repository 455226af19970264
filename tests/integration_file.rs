use crc::{Crc, CRC_32_ISO_HDLC};

use minishard::file::{make_file_input_stream, make_file_output_stream, File};
use minishard::{Config, ShardRuntime};

// Write an unaligned 1000-byte payload through the output stream, close,
// read it back: bytes and length match exactly (the 512-byte DMA tail is
// trimmed by the truncate on unaligned close).
#[test]
fn unaligned_file_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("payload.bin");

    let cfg = Config {
        smp: Some(1),
        handle_sigint: false,
        ..Config::default()
    };
    let rt = ShardRuntime::new(&cfg).expect("runtime setup");

    let code = rt.run(move || {
        let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let expected_crc = crc.checksum(&payload);

        File::open_dma(&path)
            .and_then(move |file| {
                let out = make_file_output_stream(file.clone(), 4096);
                let close_out = out.clone();
                let size_file = file.clone();
                out.write(&payload)
                    .and_then(move |_| close_out.close())
                    .and_then(move |_| size_file.size())
                    .and_then(move |size| {
                        assert_eq!(size, 1000, "DMA tail trimmed to logical size");
                        let input = make_file_input_stream(file, 0, 4096);
                        let eof_input = input.clone();
                        input.read_exactly(1000).and_then(move |data| {
                            assert_eq!(data.len(), 1000);
                            let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC);
                            assert_eq!(crc.checksum(data.as_slice()), expected_crc);
                            eof_input
                                .read()
                                .then(|tail| assert!(tail.is_empty(), "EOF after payload"))
                        })
                    })
            })
            .then(|_| ())
    });
    assert_eq!(code, 0);
}
