//! Minimal TLS ClientHello reader. It only walks far enough into the
//! handshake to find the server_name extension and never decrypts anything.
//!
//! Every offset handed back to the caller is absolute to the buffer that was
//! passed to [`parse_tls_header`], so it can be fed straight into
//! [`modify_tls_header`] or [`split_record`] on that same buffer.
use log::{debug, error};

use crate::errors::ParseError;

pub const TLS_HEADER_LEN: usize = 5;
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_TYPE_SERVER_NAME: usize = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Fatal handshake_failure alert, sent to a peer we can not make sense of.
pub const TLS_ALERT: [u8; 7] = [
    0x15, // TLS Alert
    0x03, 0x01, // TLS version
    0x00, 0x02, // Payload length
    0x02, 0x28, // Fatal, handshake failure
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// host_name exactly as sent by the client, no validation applied
    pub sni_host: Vec<u8>,
    /// Absolute position of the first host_name byte in the parsed buffer
    pub sni_offset: usize,
}

impl ClientHello {
    pub fn sni_host_lossy(&self) -> String {
        String::from_utf8_lossy(&self.sni_host).into_owned()
    }

    pub fn host_len(&self) -> usize {
        self.sni_host.len()
    }
}

// Convert big endian bytes to usize
fn to_int(data: &[u8]) -> usize {
    let mut size = 0usize;
    for byte in data {
        size = size * 256 + *byte as usize;
    }
    size
}

/// Parse a TLS record for the server name indication in the client hello.
///
/// `Incomplete` means the record header declares more bytes than `data`
/// holds; read more from the stream and call again with the larger buffer.
pub fn parse_tls_header(data: &[u8]) -> Result<ClientHello, ParseError> {
    // Check that our TCP payload is at least large enough for a TLS header
    if data.len() < TLS_HEADER_LEN {
        return Err(ParseError::Incomplete);
    }

    // SSL 2.0 compatible Client Hello: high bit of the first byte (length)
    // and content type is Client Hello. See RFC5246 Appendix E.2
    if data[0] & 0x80 != 0 && data[2] == 1 {
        debug!("received SSL 2.0 client hello which can not support SNI");
        return Err(ParseError::NoSni);
    }

    let content_type = data[0];
    if content_type != TLS_HANDSHAKE_CONTENT_TYPE {
        debug!("request did not begin with TLS handshake");
        return Err(ParseError::malformed("record is not a handshake"));
    }

    let version_major = data[1];
    let version_minor = data[2];
    if version_major < 3 {
        debug!("received SSL {version_major}.{version_minor} handshake which can not support SNI");
        return Err(ParseError::NoSni);
    }

    let record_len = to_int(&data[3..5]) + TLS_HEADER_LEN;
    if data.len() < record_len {
        return Err(ParseError::Incomplete);
    }
    // anything after the first record is not ours to look at
    let data = &data[..record_len];
    let data_len = data.len();
    let mut pos = TLS_HEADER_LEN;

    if pos + 1 > data_len {
        return Err(ParseError::malformed("missing handshake type"));
    }
    if data[pos] != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        debug!("not a client hello");
        return Err(ParseError::malformed("handshake is not a client hello"));
    }

    // handshake type (1), length (3), version (2), random (32)
    pos += 38;

    // Session ID
    if pos + 1 > data_len {
        return Err(ParseError::malformed("truncated session id"));
    }
    pos += 1 + to_int(&data[pos..pos + 1]);

    // Cipher Suites
    if pos + 2 > data_len {
        return Err(ParseError::malformed("truncated cipher suites"));
    }
    pos += 2 + to_int(&data[pos..pos + 2]);

    // Compression Methods
    if pos + 1 > data_len {
        return Err(ParseError::malformed("truncated compression methods"));
    }
    pos += 1 + to_int(&data[pos..pos + 1]);

    if pos == data_len && version_major == 3 && version_minor == 0 {
        debug!("received SSL 3.0 handshake without extensions");
        return Err(ParseError::NoSni);
    }

    // Extensions
    if pos + 2 > data_len {
        return Err(ParseError::malformed("truncated extensions length"));
    }
    let len = to_int(&data[pos..pos + 2]);
    pos += 2;
    if pos + len > data_len {
        return Err(ParseError::malformed("extensions overrun record"));
    }
    parse_extensions(&data[pos..pos + len], pos)
}

// `base` is the absolute offset of `data[0]`
fn parse_extensions(data: &[u8], base: usize) -> Result<ClientHello, ParseError> {
    let data_len = data.len();
    let mut pos = 0;
    // Parse each 4 bytes for the extension header
    while pos + 4 <= data_len {
        let extension_type = to_int(&data[pos..pos + 2]);
        let len = to_int(&data[pos + 2..pos + 4]);

        // Each extension type appears at most once, the first server_name wins
        if extension_type == EXTENSION_TYPE_SERVER_NAME {
            if pos + 4 + len > data_len {
                return Err(ParseError::malformed("server name extension overrun"));
            }
            return parse_server_name_extension(&data[pos + 4..pos + 4 + len], base + pos + 4);
        }
        pos += 4 + len;
    }
    // Check we ended where we expected to
    if pos != data_len {
        return Err(ParseError::malformed("extensions did not end on a boundary"));
    }
    Err(ParseError::NoSni)
}

fn parse_server_name_extension(data: &[u8], base: usize) -> Result<ClientHello, ParseError> {
    let data_len = data.len();
    let mut pos = 2; // skip server name list length
    while pos + 3 < data_len {
        let len = to_int(&data[pos + 1..pos + 3]);
        if pos + 3 + len > data_len {
            return Err(ParseError::malformed("server name entry overrun"));
        }

        match data[pos] {
            NAME_TYPE_HOST_NAME => {
                let mut sni_host = Vec::new();
                if let Err(cause) = sni_host.try_reserve_exact(len) {
                    error!("failed to allocate {len} bytes for server name: {cause}");
                    return Err(ParseError::AllocationFailure);
                }
                sni_host.extend_from_slice(&data[pos + 3..pos + 3 + len]);
                return Ok(ClientHello {
                    sni_host,
                    sni_offset: base + pos + 3,
                });
            }
            name_type => {
                debug!("unknown server name extension name type: {name_type}");
            }
        }
        pos += 3 + len;
    }
    // Check we ended where we expected to
    if pos != data_len {
        return Err(ParseError::malformed("server name list did not end on a boundary"));
    }
    Err(ParseError::NoSni)
}

// Validate a split offset against the record framing of `data`.
// Returns the split position and the original record payload length.
fn split_point(data: &[u8], sni_offset: usize) -> Result<(usize, usize), ParseError> {
    if data.len() < TLS_HEADER_LEN {
        return Err(ParseError::invalid(format!(
            "buffer of {} bytes has no record header",
            data.len()
        )));
    }
    let record_len = to_int(&data[3..5]);
    let split = sni_offset.saturating_add(1);
    if split <= TLS_HEADER_LEN
        || split > TLS_HEADER_LEN + record_len
        || TLS_HEADER_LEN + record_len > data.len()
    {
        return Err(ParseError::invalid(format!(
            "split at {split} does not fit record of {record_len} bytes in {} byte buffer",
            data.len()
        )));
    }
    Ok((split, record_len))
}

fn set_record_len(header: &mut [u8], len: usize) {
    header[3..5].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Split the first record of `data` into two records, cutting one byte past
/// `sni_offset`. The first record ends with the first byte of the host name.
pub fn split_record(data: &[u8], sni_offset: usize) -> Result<(Vec<u8>, Vec<u8>), ParseError> {
    let (split, record_len) = split_point(data, sni_offset)?;
    let part1_len = split - TLS_HEADER_LEN;
    let part2_len = record_len - part1_len;

    let mut first = data[..split].to_vec();
    set_record_len(&mut first, part1_len);

    let mut second = Vec::with_capacity(TLS_HEADER_LEN + part2_len);
    second.extend_from_slice(&data[..TLS_HEADER_LEN]);
    second.extend_from_slice(&data[split..TLS_HEADER_LEN + record_len]);
    set_record_len(&mut second, part2_len);
    Ok((first, second))
}

/// In-place form of [`split_record`]: a copy of the record header is inserted
/// at the split point and both length fields are rewritten. Bytes that follow
/// the first record are kept after the second one. On error `data` is left
/// untouched.
pub fn modify_tls_header(data: &mut Vec<u8>, client_hello: &ClientHello) -> Result<(), ParseError> {
    debug!("received SNI {}", client_hello.sni_host_lossy());
    let (split, record_len) = split_point(data, client_hello.sni_offset)?;
    let part1_len = split - TLS_HEADER_LEN;
    let part2_len = record_len - part1_len;

    let mut header = [0u8; TLS_HEADER_LEN];
    header.copy_from_slice(&data[..TLS_HEADER_LEN]);
    // open a gap at the split point and drop the header copy into it
    data.extend_from_slice(&header);
    data[split..].rotate_right(TLS_HEADER_LEN);

    set_record_len(&mut data[..TLS_HEADER_LEN], part1_len);
    set_record_len(&mut data[split..split + TLS_HEADER_LEN], part2_len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn extension(extension_type: u16, body: &[u8]) -> Vec<u8> {
        let mut out = extension_type.to_be_bytes().to_vec();
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn server_name(entries: &[(u8, &[u8])]) -> Vec<u8> {
        let mut list = Vec::new();
        for (name_type, name) in entries {
            list.push(*name_type);
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name);
        }
        let mut body = (list.len() as u16).to_be_bytes().to_vec();
        body.extend(list);
        extension(0x0000, &body)
    }

    // Record with a 32 byte session id, two cipher suites and null compression.
    // Extensions block, when present, starts at offset 86.
    fn client_hello(version: [u8; 2], extensions: Option<&[u8]>) -> Vec<u8> {
        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0x42; 32]);
        hello.push(32);
        hello.extend_from_slice(&[0x11; 32]);
        hello.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
        hello.extend_from_slice(&[0x01, 0x00]);
        if let Some(ext) = extensions {
            hello.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            hello.extend_from_slice(ext);
        }
        let len = hello.len();
        let mut handshake = vec![0x01, (len >> 16) as u8, (len >> 8) as u8, len as u8];
        handshake.extend(hello);

        let mut record = vec![0x16, version[0], version[1]];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend(handshake);
        record
    }

    fn example_hello() -> Vec<u8> {
        let mut ext = extension(0x000a, &[0x00, 0x02, 0x00, 0x17]);
        ext.extend(server_name(&[(0x00, b"example.com")]));
        ext.extend(extension(0x0010, &[0x00, 0x03, 0x02, b'h', b'2']));
        client_hello([0x03, 0x01], Some(&ext))
    }

    #[test]
    fn extracts_host_name() {
        let data = example_hello();
        let hello = parse_tls_header(&data).unwrap();
        assert_eq!(hello.host_len(), 11);
        assert_eq!(hello.sni_host, b"example.com");
        assert_eq!(hello.sni_host_lossy(), "example.com");
        // 86 + supported_groups (8) + ext header (4) + list len (2) + entry header (3)
        assert_eq!(hello.sni_offset, 103);
        assert_eq!(&data[hello.sni_offset..hello.sni_offset + 11], b"example.com");
    }

    #[test]
    fn every_truncation_is_incomplete() {
        let data = example_hello();
        for n in 0..data.len() {
            assert_eq!(parse_tls_header(&data[..n]), Err(ParseError::Incomplete), "truncated to {n}");
        }
    }

    #[test]
    fn trailing_bytes_after_record_are_ignored() {
        let mut data = example_hello();
        let expected = parse_tls_header(&data).unwrap();
        data.extend_from_slice(&[0x17, 0x03, 0x03, 0xff, 0xff]);
        assert_eq!(parse_tls_header(&data).unwrap(), expected);
    }

    #[test]
    fn sslv2_hello_has_no_sni() {
        let data = [0x80, 0x2e, 0x01, 0x03, 0x01, 0x00, 0x15, 0x00, 0x00];
        assert_eq!(parse_tls_header(&data), Err(ParseError::NoSni));
        assert_eq!(parse_tls_header(&data[..5]), Err(ParseError::NoSni));
    }

    #[test]
    fn old_major_version_has_no_sni() {
        let data = [0x16, 0x02, 0x00, 0x00, 0x10];
        assert_eq!(parse_tls_header(&data), Err(ParseError::NoSni));
    }

    #[test]
    fn non_handshake_record_is_malformed() {
        let data = [0x17, 0x03, 0x03, 0x00, 0x01, 0x00];
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn empty_record_is_malformed() {
        let data = [0x16, 0x03, 0x01, 0x00, 0x00];
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn server_hello_is_malformed() {
        let mut data = example_hello();
        data[5] = 0x02;
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn ssl3_without_extensions_has_no_sni() {
        let data = client_hello([0x03, 0x00], None);
        assert_eq!(parse_tls_header(&data), Err(ParseError::NoSni));
    }

    #[test]
    fn tls1_without_extensions_is_malformed() {
        let data = client_hello([0x03, 0x01], None);
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn oversized_session_id_is_malformed() {
        let mut data = example_hello();
        data[43] = 0xff;
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn extensions_without_server_name() {
        let ext = extension(0x000a, &[0x00, 0x02, 0x00, 0x17]);
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert_eq!(parse_tls_header(&data), Err(ParseError::NoSni));
    }

    #[test]
    fn extension_overrunning_block_is_malformed() {
        let ext = [0x00, 0x10, 0x00, 0xff, 0x01, 0x02, 0x03];
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));

        let ext = [0x00, 0x00, 0x00, 0x50, 0x00, 0x03, 0x00];
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn first_server_name_extension_wins() {
        let mut ext = server_name(&[(0x00, b"first.example")]);
        ext.extend(server_name(&[(0x00, b"second.example")]));
        let data = client_hello([0x03, 0x03], Some(&ext));
        let first = parse_tls_header(&data).unwrap();
        assert_eq!(first.sni_host, b"first.example");
        assert_eq!(parse_tls_header(&data).unwrap(), first);
    }

    #[test]
    fn unknown_name_types_only() {
        let ext = server_name(&[(0xff, b"abc"), (0x01, b"zz")]);
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert_eq!(parse_tls_header(&data), Err(ParseError::NoSni));
    }

    #[test]
    fn unknown_name_type_is_skipped() {
        let ext = server_name(&[(0xff, b"abc"), (0x00, b"host.test")]);
        let data = client_hello([0x03, 0x03], Some(&ext));
        let hello = parse_tls_header(&data).unwrap();
        assert_eq!(hello.sni_host, b"host.test");
        // 86 + ext header (4) + list len (2) + first entry (6) + entry header (3)
        assert_eq!(hello.sni_offset, 101);
    }

    #[test]
    fn truncated_name_entry_is_malformed() {
        let body = [0x00, 0x0e, 0x00, 0x00, 0x32, b'e', b'x', b'a', b'm', b'p', b'l', b'e'];
        let ext = extension(0x0000, &body);
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert!(matches!(parse_tls_header(&data), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn extensions_length_past_record_is_malformed() {
        let ext = extension(0x000a, &[]);
        let mut data = client_hello([0x03, 0x03], Some(&ext));
        // extensions length sits right after the null compression method
        data[84..86].copy_from_slice(&200u16.to_be_bytes());
        assert_eq!(
            parse_tls_header(&data),
            Err(ParseError::malformed("extensions overrun record"))
        );
    }

    #[test]
    fn leftover_bytes_in_name_list_are_malformed() {
        let body = [0x00, 0x06, 0xff, 0x00, 0x01, b'a', 0x01, 0x02];
        let ext = extension(0x0000, &body);
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert_eq!(
            parse_tls_header(&data),
            Err(ParseError::malformed("server name list did not end on a boundary"))
        );
    }

    #[test]
    fn empty_host_name_at_end_of_list_is_malformed() {
        let ext = server_name(&[(0x00, b"")]);
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert_eq!(
            parse_tls_header(&data),
            Err(ParseError::malformed("server name list did not end on a boundary"))
        );
    }

    #[test]
    fn control_bytes_are_kept() {
        let ext = server_name(&[(0x00, b"ex\x00\x07mple")]);
        let data = client_hello([0x03, 0x03], Some(&ext));
        assert_eq!(parse_tls_header(&data).unwrap().sni_host, b"ex\x00\x07mple");
    }

    #[test]
    fn random_buffers_never_panic() {
        let mut rng = StdRng::seed_from_u64(0x5e1f);
        let valid = example_hello();
        for round in 0..20_000 {
            let mut data: Vec<u8> = if round % 2 == 0 {
                let len = rng.gen_range(0..300);
                (0..len).map(|_| rng.gen()).collect()
            } else {
                let mut data = valid.clone();
                for _ in 0..rng.gen_range(1..6) {
                    let at = rng.gen_range(0..data.len());
                    data[at] = rng.gen();
                }
                data.truncate(rng.gen_range(0..=data.len()));
                data
            };
            // steer some of the random ones past the record header checks
            if round % 4 == 0 && data.len() >= 6 {
                let len = (data.len() - 5) as u16;
                data[0] = 0x16;
                data[1] = 0x03;
                data[3..5].copy_from_slice(&len.to_be_bytes());
                data[5] = 0x01;
            }
            if let Ok(hello) = parse_tls_header(&data) {
                assert!(hello.sni_offset < data.len());
                assert!(hello.sni_offset + hello.host_len() <= data.len());
            }
        }
    }

    #[test]
    fn split_lands_one_byte_into_host_name() {
        let ext = server_name(&[(0x00, b"example.com")]);
        let data = client_hello([0x03, 0x01], Some(&ext));
        let hello = parse_tls_header(&data).unwrap();
        assert_eq!(hello.sni_offset, 95);
        assert_eq!(data.len(), 106);

        let (first, second) = split_record(&data, hello.sni_offset).unwrap();
        assert_eq!(first.len(), 96);
        assert_eq!(&first[..5], &[0x16, 0x03, 0x01, 0x00, 91]);
        assert_eq!(first[95], b'e');
        assert_eq!(&second[..5], &[0x16, 0x03, 0x01, 0x00, 10]);
        assert_eq!(&second[5..], b"xample.com");
    }

    #[test]
    fn split_payloads_reassemble_original() {
        let data = example_hello();
        let hello = parse_tls_header(&data).unwrap();
        let (first, second) = split_record(&data, hello.sni_offset).unwrap();

        let declared = to_int(&data[3..5]);
        assert_eq!(to_int(&first[3..5]) + to_int(&second[3..5]), declared);
        assert_eq!(first.len() - 5, to_int(&first[3..5]));
        assert_eq!(second.len() - 5, to_int(&second[3..5]));

        let mut payload = first[5..].to_vec();
        payload.extend_from_slice(&second[5..]);
        assert_eq!(payload, &data[5..]);
    }

    #[test]
    fn in_place_split_matches_pure_split() {
        let data = example_hello();
        let hello = parse_tls_header(&data).unwrap();
        let (first, second) = split_record(&data, hello.sni_offset).unwrap();

        let mut buffer = data.clone();
        buffer.extend_from_slice(b"tail");
        modify_tls_header(&mut buffer, &hello).unwrap();
        assert_eq!(buffer.len(), data.len() + 4 + TLS_HEADER_LEN);
        assert_eq!(&buffer[..first.len()], &first[..]);
        assert_eq!(&buffer[first.len()..first.len() + second.len()], &second[..]);
        assert_eq!(&buffer[first.len() + second.len()..], b"tail");
    }

    #[test]
    fn bad_split_offset_is_rejected() {
        let data = example_hello();
        let hello = ClientHello {
            sni_host: b"example.com".to_vec(),
            sni_offset: data.len() + 10,
        };
        let mut buffer = data.clone();
        assert!(matches!(
            modify_tls_header(&mut buffer, &hello),
            Err(ParseError::InvalidArgument(_))
        ));
        assert_eq!(buffer, data);
        assert!(matches!(split_record(&data, 2), Err(ParseError::InvalidArgument(_))));
        assert!(matches!(split_record(&data[..3], 1), Err(ParseError::InvalidArgument(_))));
    }

    #[test]
    fn alert_is_fatal_handshake_failure() {
        assert_eq!(TLS_ALERT.len(), 7);
        assert_eq!(TLS_ALERT[0], 0x15);
        assert_eq!(to_int(&TLS_ALERT[3..5]), 2);
        assert_eq!(&TLS_ALERT[5..], &[0x02, 0x28]);
    }
}
