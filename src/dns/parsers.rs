use nom::{
    bytes::complete::{tag, take},
    combinator::{flat_map, map, map_res},
    multi::many_till,
    number::complete::{be_u16, be_u8},
    sequence::tuple,
    IResult,
};

use super::{Flags, Header, MessageType, Question};

pub fn parse_header(packet: &[u8]) -> IResult<&[u8], Header> {
    let parse_header = tuple((be_u16, parse_flags, be_u16, be_u16, be_u16, be_u16));
    map(
        parse_header,
        |(
            id,
            flags,
            questions,
            answer_resource_records,
            authority_resource_records,
            additional_resource_records,
        )| Header {
            id,
            flags,
            questions,
            answer_resource_records,
            authority_resource_records,
            additional_resource_records,
        },
    )(packet)
}

pub fn parse_question(questions: &[u8]) -> IResult<&[u8], Question<'_>> {
    let parse_question = tuple((parse_name, be_u16, be_u16));
    map(parse_question, |(name, type_, class)| Question {
        name,
        type_,
        class,
    })(questions)
}

fn parse_name(label_part: &[u8]) -> IResult<&[u8], Vec<&str>> {
    map(many_till(parse_label, tag("\0")), |(name, _)| name)(label_part)
}

fn parse_label(label_part: &[u8]) -> IResult<&[u8], &str> {
    map_res(flat_map(be_u8, take), std::str::from_utf8)(label_part)
}

fn parse_flags(flags: &[u8]) -> IResult<&[u8], Flags> {
    map(be_u16, |flags| Flags {
        message_type: if flags & 0x8000 == 0 {
            MessageType::Query
        } else {
            MessageType::Response
        },
        opcode: ((flags >> 11) & 0x0f) as u8,
        rcode: (flags & 0x0f) as u8,
    })(flags)
}
