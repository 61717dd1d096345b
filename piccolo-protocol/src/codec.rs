/// Read and write implementations for the protocol frames
use std::io::{self, ErrorKind, Read, Write};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::ProtocolError,
    protocol::{FRAME_LEN, Opcode, SAMPLE_SIZE, SampleBuffer},
};

/// Reads from `reader` until `buf` is completely filled.
///
/// Returns `Ok(false)` if the peer closed the stream before `buf` was full; the
/// bytes read so far are discarded by the caller.
pub fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

/// A 16-byte frame carrying `value` as little-endian u32 followed by zero padding.
pub fn header(value: u32) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..4].copy_from_slice(&value.to_le_bytes());
    frame
}

/// Extracts the little-endian u32 from the start of a 16-byte frame.
/// The padding is not inspected.
pub fn header_value(frame: &[u8; FRAME_LEN]) -> u32 {
    u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]])
}

impl Opcode {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&header(self.code()))
    }

    /// Reads one opcode frame. Returns `Ok(None)` if the stream ended, even mid-frame.
    pub fn from_reader(reader: &mut impl Read) -> Result<Option<Opcode>, ProtocolError> {
        let mut frame = [0u8; FRAME_LEN];
        if !read_full(reader, &mut frame)? {
            return Ok(None);
        }
        Ok(Some(Opcode::from_code(header_value(&frame))))
    }
}

/// Writes `value` as a length-prefixed JSON frame in a single write.
pub fn write_json_frame<T: Serialize + ?Sized>(
    writer: &mut impl Write,
    value: &T,
) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::TooManyBytes {
        max: u32::MAX as usize,
        got: payload.len(),
    })?;
    let mut message = Vec::with_capacity(FRAME_LEN + payload.len());
    message.extend_from_slice(&header(len));
    message.extend_from_slice(&payload);
    writer.write_all(&message)?;
    Ok(())
}

/// Reads one length-prefixed JSON frame.
///
/// The header and the payload are each read completely before anything is parsed.
/// Returns `Ok(None)` if the stream ended before the frame was complete.
pub fn read_json_frame<T: DeserializeOwned>(
    reader: &mut impl Read,
    max_payload_len: usize,
) -> Result<Option<T>, ProtocolError> {
    let mut frame = [0u8; FRAME_LEN];
    if !read_full(reader, &mut frame)? {
        return Ok(None);
    }
    let len = header_value(&frame) as usize;
    if len > max_payload_len {
        return Err(ProtocolError::TooManyBytes {
            max: max_payload_len,
            got: len,
        });
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&payload)?))
}

impl SampleBuffer {
    /// Raw little-endian representation: all samples of channel 1, then channel 2.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::byte_len(self.samples_per_channel()));
        for sample in self.ch1().iter().chain(self.ch2()) {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8], samples_per_channel: usize) -> Result<SampleBuffer, ProtocolError> {
        let expected = Self::byte_len(samples_per_channel);
        if bytes.len() != expected {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes of samples, got {}",
                expected,
                bytes.len()
            )));
        }
        let mut samples = bytes
            .chunks_exact(SAMPLE_SIZE)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        let ch1 = samples.by_ref().take(samples_per_channel).collect();
        let ch2 = samples.collect();
        SampleBuffer::new(ch1, ch2)
    }

    /// Reads exactly one raw reply. A reply cut short by the peer yields `Ok(None)`,
    /// never a partially filled buffer.
    pub fn from_reader(
        reader: &mut impl Read,
        samples_per_channel: usize,
    ) -> Result<Option<SampleBuffer>, ProtocolError> {
        let mut raw = vec![0u8; Self::byte_len(samples_per_channel)];
        if !read_full(reader, &mut raw)? {
            return Ok(None);
        }
        Self::from_bytes(&raw, samples_per_channel).map(Some)
    }
}

#[cfg(test)]
mod test {
    use std::io::{Cursor, Read};

    use crate::codec::{read_json_frame, write_json_frame};
    use crate::error::ProtocolError;
    use crate::protocol::{
        DEFAULT_MAX_PAYLOAD_LEN, FRAME_LEN, Opcode, RegisterValue, SampleBuffer, SetRequest,
        Snapshot,
    };

    /// Hands out at most `chunk` bytes per read call.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        chunk: usize,
        reads: usize,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Trickle {
            Trickle {
                data: Cursor::new(data),
                chunk,
                reads: 0,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads += 1;
            let n = buf.len().min(self.chunk);
            self.data.read(&mut buf[..n])
        }
    }

    #[test]
    fn write_shutdown_frame() {
        let mut out = Vec::new();
        Opcode::Shutdown.write_to(&mut out).unwrap();
        let mut expected = vec![99u8, 0, 0, 0];
        expected.resize(FRAME_LEN, 0);
        assert_eq!(out, expected);
    }

    #[test]
    fn read_acquire_frame() {
        let mut data = 3u32.to_le_bytes().to_vec();
        data.resize(FRAME_LEN, 0);
        let mut cursor = Cursor::new(data);
        assert_eq!(
            Opcode::from_reader(&mut cursor).unwrap(),
            Some(Opcode::Acquire)
        );
        assert_eq!(Opcode::from_reader(&mut cursor).unwrap(), None);
    }

    #[test]
    fn unknown_opcode_is_preserved() {
        let mut data = 7u32.to_le_bytes().to_vec();
        data.resize(FRAME_LEN, 0xff);
        let mut cursor = Cursor::new(data);
        assert_eq!(
            Opcode::from_reader(&mut cursor).unwrap(),
            Some(Opcode::Unknown(7))
        );
    }

    #[test]
    fn truncated_opcode_frame_is_end_of_stream() {
        let mut cursor = Cursor::new(vec![3u8, 0, 0]);
        assert_eq!(Opcode::from_reader(&mut cursor).unwrap(), None);
    }

    #[test]
    fn json_frame_layout() {
        let request = SetRequest::new("low_intensity_thresh[0]", 1234i64);
        let mut out = Vec::new();
        write_json_frame(&mut out, &request).unwrap();

        let payload = br#"{"name":"low_intensity_thresh[0]","value":1234}"#;
        assert_eq!(&out[..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&out[4..FRAME_LEN], &[0u8; 12]);
        assert_eq!(&out[FRAME_LEN..], payload);
    }

    #[test]
    fn json_frame_delivered_byte_by_byte() {
        let mut snapshot = Snapshot::new();
        snapshot.insert("droplet_id".to_string(), RegisterValue::Int(17));
        snapshot.insert("sort_enable".to_string(), RegisterValue::Bits("101".into()));
        let mut data = Vec::new();
        write_json_frame(&mut data, &snapshot).unwrap();
        let total = data.len();

        let mut reader = Trickle::new(data, 1);
        let decoded: Snapshot = read_json_frame(&mut reader, DEFAULT_MAX_PAYLOAD_LEN)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(reader.reads, total);
    }

    #[test]
    fn json_frame_cut_short() {
        let mut data = Vec::new();
        write_json_frame(&mut data, &SetRequest::new("a", 1i64)).unwrap();
        data.truncate(data.len() - 1);
        let mut reader = Trickle::new(data, 3);
        let decoded: Option<SetRequest> =
            read_json_frame(&mut reader, DEFAULT_MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn json_frame_too_large() {
        let mut data = 4096u32.to_le_bytes().to_vec();
        data.resize(FRAME_LEN, 0);
        let mut cursor = Cursor::new(data);
        match read_json_frame::<SetRequest>(&mut cursor, 1024) {
            Err(ProtocolError::TooManyBytes { max, got }) => {
                assert_eq!(max, 1024);
                assert_eq!(got, 4096);
            }
            other => panic!("expected TooManyBytes, got {:?}", other),
        }
    }

    #[test]
    fn set_request_shape_mismatch() {
        let mut data = Vec::new();
        write_json_frame(&mut data, &serde_json::json!({"name": "a", "value": 1.5})).unwrap();
        let mut cursor = Cursor::new(data);
        assert!(matches!(
            read_json_frame::<SetRequest>(&mut cursor, DEFAULT_MAX_PAYLOAD_LEN),
            Err(ProtocolError::InvalidJson(_))
        ));

        let mut data = Vec::new();
        write_json_frame(&mut data, &serde_json::json!({"value": 1})).unwrap();
        let mut cursor = Cursor::new(data);
        assert!(matches!(
            read_json_frame::<SetRequest>(&mut cursor, DEFAULT_MAX_PAYLOAD_LEN),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn values_beyond_i64_are_accepted() {
        let mut data = Vec::new();
        write_json_frame(
            &mut data,
            &serde_json::json!({"name": "min_width_thresh[0]", "value": u64::MAX}),
        )
        .unwrap();
        let mut cursor = Cursor::new(data);
        let request = read_json_frame::<SetRequest>(&mut cursor, DEFAULT_MAX_PAYLOAD_LEN)
            .unwrap()
            .unwrap();
        assert_eq!(request.value, RegisterValue::Int(-1));

        let request: SetRequest =
            serde_json::from_str(r#"{"name": "a", "value": 9223372036854775808}"#).unwrap();
        assert_eq!(request.value, RegisterValue::Int(i64::MIN));
    }

    #[test]
    fn bitfield_values_stay_strings() {
        let request: SetRequest =
            serde_json::from_str(r#"{"name": "gate_mode", "value": "0110"}"#).unwrap();
        assert_eq!(request.value, RegisterValue::Bits("0110".into()));
    }

    #[test]
    fn sample_buffer_layout() {
        let n = 4096;
        let ch1: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let ch2: Vec<f32> = (0..n).map(|i| -(i as f32) - 0.5).collect();
        let buffer = SampleBuffer::new(ch1.clone(), ch2.clone()).unwrap();

        let raw = buffer.to_bytes();
        assert_eq!(raw.len(), 8192 * 4);
        let floats: Vec<f32> = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats.len(), 8192);
        assert_eq!(&floats[..4096], &ch1[..]);
        assert_eq!(&floats[4096..], &ch2[..]);
    }

    #[test]
    fn sample_buffer_delivered_in_small_chunks() {
        let buffer = SampleBuffer::new(vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]).unwrap();
        let mut reader = Trickle::new(buffer.to_bytes(), 5);
        let decoded = SampleBuffer::from_reader(&mut reader, 3).unwrap().unwrap();
        assert_eq!(decoded, buffer);
    }

    #[test]
    fn partial_sample_buffer_is_not_published() {
        let buffer = SampleBuffer::new(vec![1.0, 2.0], vec![3.0, 4.0]).unwrap();
        let mut raw = buffer.to_bytes();
        raw.truncate(raw.len() - 2);
        let mut reader = Trickle::new(raw, 1);
        assert_eq!(SampleBuffer::from_reader(&mut reader, 2).unwrap(), None);
    }

    #[test]
    fn mismatched_channels_are_rejected() {
        assert!(SampleBuffer::new(vec![0.0; 3], vec![0.0; 2]).is_err());
    }
}
