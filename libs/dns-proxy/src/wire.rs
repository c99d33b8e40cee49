//! DNS wire format (RFC 1035): parse queries and upstream responses,
//! build answers. Minimal-allocation parsing from byte buffers with
//! pointer-compression support.
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::records::{DnsRecord, RData, RecordType};

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;
pub const RCODE_REFUSED: u8 = 5;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),
    #[error("name compression loop detected")]
    CompressionLoop,
    #[error("invalid utf-8 in name")]
    InvalidUtf8,
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("name exceeds 253 characters")]
    NameTooLong,
    #[error("label too long: {0} bytes")]
    LabelTooLong(usize),
}

/// The 12-byte header.
#[derive(Debug, Clone)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

impl Header {
    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }
    pub fn recursion_desired(&self) -> bool {
        self.flags & 0x0100 != 0
    }
    pub fn is_truncated(&self) -> bool {
        self.flags & 0x0200 != 0
    }
    pub fn rcode(&self) -> u8 {
        (self.flags & 0xF) as u8
    }
}

#[derive(Debug, Clone)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
}

/// A parsed client query, keeping the raw question bytes for echoing
/// into the response.
#[derive(Debug, Clone)]
pub struct Query {
    pub header: Header,
    pub questions: Vec<Question>,
    raw_question: Vec<u8>,
}

impl Query {
    pub fn first(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// Parse a name with pointer compression. Returns (name, end offset).
pub fn parse_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), WireError> {
    let mut name = String::with_capacity(64);
    let mut jumped = false;
    let mut end = 0;
    let mut jumps = 0;
    const MAX_JUMPS: usize = 10;

    loop {
        if offset >= buf.len() {
            return Err(WireError::Truncated(offset));
        }
        let len = buf[offset] as usize;

        if len & 0xC0 == 0xC0 {
            if offset + 1 >= buf.len() {
                return Err(WireError::Truncated(offset));
            }
            if !jumped {
                end = offset + 2;
            }
            offset = ((len & 0x3F) << 8) | buf[offset + 1] as usize;
            jumped = true;
            jumps += 1;
            if jumps > MAX_JUMPS {
                return Err(WireError::CompressionLoop);
            }
            continue;
        }
        if len == 0 {
            if !jumped {
                end = offset + 1;
            }
            break;
        }
        if len > 63 {
            return Err(WireError::LabelTooLong(len));
        }
        offset += 1;
        if offset + len > buf.len() {
            return Err(WireError::Truncated(offset));
        }
        if !name.is_empty() {
            name.push('.');
        }
        let label =
            std::str::from_utf8(&buf[offset..offset + len]).map_err(|_| WireError::InvalidUtf8)?;
        name.push_str(label);
        offset += len;
        if name.len() > 253 {
            return Err(WireError::NameTooLong);
        }
    }
    Ok((name, end))
}

/// Encode a name as wire labels.
pub fn encode_name(name: &str, buf: &mut Vec<u8>) {
    if name.is_empty() || name == "." {
        buf.push(0);
        return;
    }
    for label in name.trim_end_matches('.').split('.') {
        let len = label.len().min(63);
        buf.push(len as u8);
        buf.extend_from_slice(&label.as_bytes()[..len]);
    }
    buf.push(0);
}

fn parse_header(buf: &[u8]) -> Result<Header, WireError> {
    if buf.len() < 12 {
        return Err(WireError::TooShort(buf.len()));
    }
    Ok(Header {
        id: u16::from_be_bytes([buf[0], buf[1]]),
        flags: u16::from_be_bytes([buf[2], buf[3]]),
        qd_count: u16::from_be_bytes([buf[4], buf[5]]),
        an_count: u16::from_be_bytes([buf[6], buf[7]]),
        ns_count: u16::from_be_bytes([buf[8], buf[9]]),
        ar_count: u16::from_be_bytes([buf[10], buf[11]]),
    })
}

/// Parse a client query packet.
pub fn parse_query(buf: &[u8]) -> Result<Query, WireError> {
    let header = parse_header(buf)?;
    let mut offset = 12;
    let question_start = offset;
    let mut questions = Vec::with_capacity(header.qd_count as usize);
    for _ in 0..header.qd_count {
        let (name, end) = parse_name(buf, offset)?;
        offset = end;
        if offset + 4 > buf.len() {
            return Err(WireError::Truncated(offset));
        }
        let qtype = RecordType::from_u16(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
        offset += 4;
        questions.push(Question {
            name: name.to_lowercase(),
            qtype,
        });
    }
    Ok(Query {
        header,
        questions,
        raw_question: buf[question_start..offset].to_vec(),
    })
}

/// Parse the answer records of an upstream response. OPT records (type
/// 41) are dropped, they must not be cached or forwarded on.
pub fn parse_answers(buf: &[u8]) -> Result<(Header, Vec<DnsRecord>), WireError> {
    let header = parse_header(buf)?;
    let mut offset = 12;
    for _ in 0..header.qd_count {
        let (_, end) = parse_name(buf, offset)?;
        offset = end + 4;
    }
    let mut answers = Vec::new();
    for _ in 0..header.an_count {
        if offset >= buf.len() {
            break;
        }
        let (name, end) = parse_name(buf, offset)?;
        offset = end;
        if offset + 10 > buf.len() {
            return Err(WireError::Truncated(offset));
        }
        let rtype_raw = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let ttl = u32::from_be_bytes([
            buf[offset + 4],
            buf[offset + 5],
            buf[offset + 6],
            buf[offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlength > buf.len() {
            return Err(WireError::Truncated(offset));
        }
        let rtype = RecordType::from_u16(rtype_raw);
        let rdata = parse_rdata(buf, offset, rdlength, rtype)?;
        offset += rdlength;
        if rtype_raw == 41 {
            continue;
        }
        answers.push(DnsRecord {
            name: name.to_lowercase(),
            rtype,
            ttl,
            rdata,
        });
    }
    Ok((header, answers))
}

fn parse_rdata(
    buf: &[u8],
    offset: usize,
    rdlength: usize,
    rtype: RecordType,
) -> Result<RData, WireError> {
    match rtype {
        RecordType::A if rdlength == 4 => Ok(RData::A(Ipv4Addr::new(
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ))),
        RecordType::Aaaa if rdlength == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[offset..offset + 16]);
            Ok(RData::Aaaa(Ipv6Addr::from(octets)))
        }
        RecordType::Cname | RecordType::Ptr | RecordType::Ns => {
            let (name, _) = parse_name(buf, offset)?;
            Ok(match rtype {
                RecordType::Cname => RData::Cname(name),
                RecordType::Ptr => RData::Ptr(name),
                _ => RData::Ns(name),
            })
        }
        RecordType::Mx if rdlength >= 3 => {
            let preference = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let (exchange, _) = parse_name(buf, offset + 2)?;
            Ok(RData::Mx {
                preference,
                exchange,
            })
        }
        RecordType::Txt => {
            let mut txt = String::new();
            let mut pos = offset;
            let end = offset + rdlength;
            while pos < end {
                let len = buf[pos] as usize;
                pos += 1;
                if pos + len > end {
                    break;
                }
                if let Ok(s) = std::str::from_utf8(&buf[pos..pos + len]) {
                    txt.push_str(s);
                }
                pos += len;
            }
            Ok(RData::Txt(txt))
        }
        _ => Ok(RData::Raw(buf[offset..offset + rdlength].to_vec())),
    }
}

/// Build a response to `query` with the given answers and rcode.
pub fn build_response(query: &Query, answers: &[DnsRecord], rcode: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    buf.extend_from_slice(&query.header.id.to_be_bytes());
    let flags: u16 = 0x8000
        | (if query.header.recursion_desired() { 0x0100 } else { 0 })
        | 0x0080
        | (rcode as u16 & 0xF);
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&query.header.qd_count.to_be_bytes());
    buf.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&query.raw_question);
    for record in answers {
        encode_name(&record.name, &mut buf);
        buf.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // class IN
        buf.extend_from_slice(&record.ttl.to_be_bytes());
        encode_rdata(&record.rdata, &mut buf);
    }
    buf
}

fn encode_rdata(rdata: &RData, buf: &mut Vec<u8>) {
    match rdata {
        RData::A(ip) => {
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        RData::Aaaa(ip) => {
            buf.extend_from_slice(&16u16.to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        RData::Cname(name) | RData::Ptr(name) | RData::Ns(name) => {
            let mut inner = Vec::new();
            encode_name(name, &mut inner);
            buf.extend_from_slice(&(inner.len() as u16).to_be_bytes());
            buf.extend_from_slice(&inner);
        }
        RData::Mx {
            preference,
            exchange,
        } => {
            let mut inner = Vec::new();
            inner.extend_from_slice(&preference.to_be_bytes());
            encode_name(exchange, &mut inner);
            buf.extend_from_slice(&(inner.len() as u16).to_be_bytes());
            buf.extend_from_slice(&inner);
        }
        RData::Txt(text) => {
            let mut inner = Vec::new();
            for chunk in text.as_bytes().chunks(255) {
                inner.push(chunk.len() as u8);
                inner.extend_from_slice(chunk);
            }
            if text.is_empty() {
                inner.push(0);
            }
            buf.extend_from_slice(&(inner.len() as u16).to_be_bytes());
            buf.extend_from_slice(&inner);
        }
        RData::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            let mut inner = Vec::new();
            encode_name(mname, &mut inner);
            encode_name(rname, &mut inner);
            for v in [serial, refresh, retry, expire, minimum] {
                inner.extend_from_slice(&v.to_be_bytes());
            }
            buf.extend_from_slice(&(inner.len() as u16).to_be_bytes());
            buf.extend_from_slice(&inner);
        }
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            let mut inner = Vec::new();
            inner.extend_from_slice(&priority.to_be_bytes());
            inner.extend_from_slice(&weight.to_be_bytes());
            inner.extend_from_slice(&port.to_be_bytes());
            encode_name(target, &mut inner);
            buf.extend_from_slice(&(inner.len() as u16).to_be_bytes());
            buf.extend_from_slice(&inner);
        }
        RData::Raw(data) => {
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data);
        }
    }
}

/// Build a bare query for `name`/`qtype`, used by the upstream health
/// probe.
pub fn build_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    encode_name(name, &mut buf);
    buf.extend_from_slice(&qtype.to_u16().to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf
}

/// Clamp a response to `max_size` for plain UDP, setting TC and zeroing
/// the record counts.
pub fn truncate_for_udp(response: &mut Vec<u8>, max_size: usize) {
    if response.len() <= max_size {
        return;
    }
    if response.len() >= 3 {
        response[2] |= 0x02;
    }
    response.truncate(max_size);
    if response.len() >= 12 {
        for i in 6..12 {
            response[i] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        let mut buf = Vec::new();
        encode_name("www.example.com", &mut buf);
        assert_eq!(buf, b"\x03www\x07example\x03com\x00");
        let (name, end) = parse_name(&buf, 0).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(end, buf.len());
    }

    #[test]
    fn root_name_encodes_to_null_label() {
        let mut buf = Vec::new();
        encode_name(".", &mut buf);
        assert_eq!(buf, b"\x00");
    }

    #[test]
    fn pointer_compression() {
        let mut buf = Vec::new();
        encode_name("example.com", &mut buf);
        let ptr_at = buf.len();
        buf.extend_from_slice(&[0xC0, 0x00]);
        let (name, end) = parse_name(&buf, ptr_at).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(end, ptr_at + 2);
    }

    #[test]
    fn query_and_response_round_trip() {
        let query_bytes = build_query(0x1234, "host.lan", RecordType::A);
        let query = parse_query(&query_bytes).unwrap();
        assert_eq!(query.first().unwrap().name, "host.lan");
        assert_eq!(query.first().unwrap().qtype, RecordType::A);

        let answers = vec![DnsRecord::a("host.lan", Ipv4Addr::new(192, 168, 1, 5), 300)];
        let resp = build_response(&query, &answers, RCODE_NOERROR);
        let (header, parsed) = parse_answers(&resp).unwrap();
        assert!(header.is_response());
        assert_eq!(header.rcode(), RCODE_NOERROR);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].rdata, RData::A(Ipv4Addr::new(192, 168, 1, 5)));
    }

    #[test]
    fn nxdomain_response() {
        let query_bytes = build_query(7, "missing.lan", RecordType::A);
        let query = parse_query(&query_bytes).unwrap();
        let resp = build_response(&query, &[], RCODE_NXDOMAIN);
        let (header, answers) = parse_answers(&resp).unwrap();
        assert_eq!(header.rcode(), RCODE_NXDOMAIN);
        assert!(answers.is_empty());
    }

    #[test]
    fn truncation_sets_tc() {
        let query_bytes = build_query(9, "big.lan", RecordType::A);
        let query = parse_query(&query_bytes).unwrap();
        let answers: Vec<DnsRecord> = (0..100)
            .map(|i| DnsRecord::a("big.lan", Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8), 60))
            .collect();
        let mut resp = build_response(&query, &answers, RCODE_NOERROR);
        truncate_for_udp(&mut resp, 512);
        assert_eq!(resp.len(), 512);
        let header = parse_query(&resp).unwrap().header;
        assert!(header.is_truncated());
    }
}
