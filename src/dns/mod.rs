use anyhow::{anyhow, Result};

mod parsers;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MessageType {
    Query,
    Response,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Flags {
    pub message_type: MessageType,
    pub opcode: u8,
    pub rcode: u8,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Header {
    pub id: u16,
    pub flags: Flags,
    pub questions: u16,
    pub answer_resource_records: u16,
    pub authority_resource_records: u16,
    pub additional_resource_records: u16,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Question<'a> {
    pub name: Vec<&'a str>,
    pub type_: u16,
    pub class: u16,
}

impl Question<'_> {
    pub fn qname(&self) -> String {
        if self.name.is_empty() {
            ".".to_owned()
        } else {
            self.name.join(".")
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Summary<'a> {
    pub header: Header,
    pub question: Option<Question<'a>>,
}

pub fn parse_summary(packet: &[u8]) -> Result<Summary<'_>> {
    let (rest, header) = parsers::parse_header(packet).map_err(|err| {
        anyhow!(
            "got error while parsing dns header. Err: {:?}, raw_packet: {:02X?}",
            err,
            packet
        )
    })?;
    let question = if header.questions == 0 {
        None
    } else {
        let (_, question) = parsers::parse_question(rest).map_err(|err| {
            anyhow!(
                "got error while parsing dns question. Err: {:?}, raw_packet: {:02X?}",
                err,
                packet
            )
        })?;
        Some(question)
    };
    Ok(Summary { header, question })
}

pub fn qtype_name(type_: u16) -> String {
    let name = match type_ {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        35 => "NAPTR",
        43 => "DS",
        46 => "RRSIG",
        48 => "DNSKEY",
        64 => "SVCB",
        65 => "HTTPS",
        255 => "ANY",
        other => return format!("TYPE{}", other),
    };
    name.to_owned()
}

pub fn rcode_name(rcode: u8) -> String {
    let name = match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        other => return format!("RCODE{}", other),
    };
    name.to_owned()
}

#[cfg(test)]
pub(crate) fn build_packet(id: u16, response: bool, qname: &str, qtype: u16) -> Vec<u8> {
    let flags: u16 = if response { 0x8180 } else { 0x0100 };
    let mut packet = Vec::new();
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in qname.split('.').filter(|l| !l.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&[0, 1]);
    packet
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::{build_packet, parse_summary, Flags, Header, MessageType, Question, Summary};

    #[test]
    fn should_parse_query_summary() -> Result<()> {
        let packet = build_packet(0xa542, false, "www.google.com", 1);

        let summary = parse_summary(&packet)?;

        assert_eq!(
            summary,
            Summary {
                header: Header {
                    id: 0xa542,
                    flags: Flags {
                        message_type: MessageType::Query,
                        opcode: 0,
                        rcode: 0,
                    },
                    questions: 1,
                    answer_resource_records: 0,
                    authority_resource_records: 0,
                    additional_resource_records: 0,
                },
                question: Some(Question {
                    name: vec!["www", "google", "com"],
                    type_: 1,
                    class: 1,
                }),
            }
        );
        Ok(())
    }

    #[test]
    fn should_parse_response_flags() -> Result<()> {
        let mut packet = build_packet(7, true, "example.org", 28);
        packet[3] |= 0x03;

        let summary = parse_summary(&packet)?;

        assert_eq!(summary.header.flags.message_type, MessageType::Response);
        assert_eq!(summary.header.flags.rcode, 3);
        assert_eq!(summary.question.unwrap().qname(), "example.org");
        Ok(())
    }

    #[test]
    fn should_fail_on_truncated_question() {
        let packet = build_packet(7, false, "example.org", 1);

        assert!(parse_summary(&packet[..16]).is_err());
        assert!(parse_summary(&packet[..5]).is_err());
    }
}
