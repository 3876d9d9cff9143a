use crate::{
    protocol::{CommandKind, MAX_FRAME_LEN, ProtocolError, SIZE_LEN, read_size},
    value::{ByteReader, TypedValue, ValueType, encode_str},
};

/// Size field, success flag and the length prefix of an empty message.
const MIN_RESPONSE_LEN: usize = SIZE_LEN + 1 + size_of::<i32>();

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub extra: Vec<TypedValue>,
    /// Not carried on the wire for schema creation, decodes as 0 there.
    pub response_time_nanos: i64,
}

impl Response {
    #[must_use]
    pub const fn success(response_time_nanos: i64) -> Self {
        Self {
            success: true,
            message: String::new(),
            extra: vec![],
            response_time_nanos,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>, response_time_nanos: i64) -> Self {
        Self {
            success: false,
            message: message.into(),
            extra: vec![],
            response_time_nanos,
        }
    }

    #[must_use]
    pub fn not_implemented(kind: CommandKind) -> Self {
        Self::failure(format!("{kind} is not implemented"), 0)
    }

    #[must_use]
    pub fn with_extra(mut self, extra: Vec<TypedValue>) -> Self {
        self.extra = extra;
        self
    }

    /// Length of the encoded frame as an answer to `kind`.
    #[must_use]
    pub fn encoded_len(&self, kind: CommandKind) -> usize {
        MIN_RESPONSE_LEN
            + self.message.len()
            + self.extra.iter().map(TypedValue::encoded_len).sum::<usize>()
            + if kind.reports_elapsed() {
                size_of::<i64>()
            } else {
                0
            }
    }

    fn check_shape(&self, kind: CommandKind) -> Result<(), ProtocolError> {
        let layout = kind.response_extras().ok_or(ProtocolError::NoResponse(kind))?;

        if layout.len() != self.extra.len()
            || layout
                .iter()
                .zip(&self.extra)
                .any(|(expected, value)| *expected != value.value_type())
        {
            return Err(ProtocolError::ResponseShape(kind));
        }

        Ok(())
    }
}

pub fn encode_response(kind: CommandKind, response: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(response.encoded_len(kind));
    encode_response_into(kind, response, &mut out)?;

    Ok(out)
}

/// Appends the frame to `out`, leaving `out` untouched on error.
pub fn encode_response_into(
    kind: CommandKind,
    response: &Response,
    out: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    response.check_shape(kind)?;

    let len = response.encoded_len(kind);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let size = i64::try_from(len).map_err(|_| ProtocolError::FrameTooLarge(len))?;
    out.extend_from_slice(&size.to_le_bytes());
    TypedValue::Bool(response.success).encode(out);
    encode_str(&response.message, out);
    for value in &response.extra {
        value.encode(out);
    }
    if kind.reports_elapsed() {
        TypedValue::Long(response.response_time_nanos).encode(out);
    }

    Ok(())
}

/// Decodes the first response in `bytes`, given the kind of command it answers.
///
/// Returns `Ok(None)` while the frame is incomplete, otherwise the response
/// and the number of bytes it occupied.
pub fn decode_response(
    kind: CommandKind,
    bytes: &[u8],
) -> Result<Option<(Response, usize)>, ProtocolError> {
    let layout = kind.response_extras().ok_or(ProtocolError::NoResponse(kind))?;

    let Some(declared) = read_size(bytes) else {
        return Ok(None);
    };
    let size = usize::try_from(declared)
        .ok()
        .filter(|size| (MIN_RESPONSE_LEN..=MAX_FRAME_LEN).contains(size))
        .ok_or(ProtocolError::InvalidFrameSize(declared))?;

    let Some(frame) = bytes.get(SIZE_LEN..size) else {
        return Ok(None);
    };

    let mut reader = ByteReader::new(frame);
    let TypedValue::Bool(success) = TypedValue::decode(ValueType::Bool, &mut reader)? else {
        return Err(ProtocolError::ResponseShape(kind));
    };
    let TypedValue::String(message) = TypedValue::decode(ValueType::String, &mut reader)? else {
        return Err(ProtocolError::ResponseShape(kind));
    };
    let extra = layout
        .iter()
        .map(|value_type| TypedValue::decode(*value_type, &mut reader))
        .collect::<Result<Vec<_>, _>>()?;
    let response_time_nanos = if kind.reports_elapsed() {
        reader.read_i64()?
    } else {
        0
    };

    if reader.remaining() != 0 {
        return Err(ProtocolError::TrailingBytes);
    }

    Ok(Some((
        Response {
            success,
            message,
            extra,
            response_time_nanos,
        },
        size,
    )))
}
