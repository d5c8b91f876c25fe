use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    combinator::{all_consuming, verify},
    multi::{length_data, many0},
    number::complete::be_u32,
    sequence::{pair, preceded},
    IResult,
};

use super::FramestreamError;

pub const MAX_CONTROL_FRAME_LENGTH: usize = 512;
const FIELD_CONTENT_TYPE: u32 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Accept,
    Start,
    Stop,
    Ready,
    Finish,
}

impl ControlType {
    fn code(self) -> u32 {
        match self {
            ControlType::Accept => 0x01,
            ControlType::Start => 0x02,
            ControlType::Stop => 0x03,
            ControlType::Ready => 0x04,
            ControlType::Finish => 0x05,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0x01 => Some(ControlType::Accept),
            0x02 => Some(ControlType::Start),
            0x03 => Some(ControlType::Stop),
            0x04 => Some(ControlType::Ready),
            0x05 => Some(ControlType::Finish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub kind: ControlType,
    pub content_types: Vec<Bytes>,
}

impl ControlFrame {
    pub fn new(kind: ControlType) -> Self {
        Self {
            kind,
            content_types: Vec::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: Bytes) -> Self {
        self.content_types.push(content_type);
        self
    }

    pub fn offers(&self, content_type: &[u8]) -> bool {
        self.content_types.is_empty() || self.content_types.iter().any(|ct| ct == content_type)
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FramestreamError> {
        let (_, (code, fields)) = parse_control(frame).map_err(|err| {
            FramestreamError::MalformedControl(format!("{:?}, raw_frame: {:02X?}", err, frame))
        })?;
        let kind = ControlType::from_code(code).ok_or(FramestreamError::UnknownControl(code))?;
        Ok(Self {
            kind,
            content_types: fields.into_iter().map(Bytes::copy_from_slice).collect(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let fields_length: usize = self.content_types.iter().map(|ct| 8 + ct.len()).sum();
        buf.reserve(12 + fields_length);
        buf.put_u32(0);
        buf.put_u32((4 + fields_length) as u32);
        buf.put_u32(self.kind.code());
        for content_type in &self.content_types {
            buf.put_u32(FIELD_CONTENT_TYPE);
            buf.put_u32(content_type.len() as u32);
            buf.put_slice(content_type);
        }
    }
}

fn parse_control(frame: &[u8]) -> IResult<&[u8], (u32, Vec<&[u8]>)> {
    all_consuming(pair(be_u32, many0(parse_content_type_field)))(frame)
}

fn parse_content_type_field(field: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(
        verify(be_u32, |kind: &u32| *kind == FIELD_CONTENT_TYPE),
        length_data(be_u32),
    )(field)
}
