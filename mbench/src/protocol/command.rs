use std::fmt::{self, Display};

use crate::{
    protocol::{COMMAND_HEADER_LEN, ProtocolError, SIZE_LEN, read_size},
    value::{ByteReader, TypedValue, ValueType},
    workload::BatchParams,
};

const BATCH_ARGS: [ValueType; 8] = [
    ValueType::Int,
    ValueType::Double,
    ValueType::Double,
    ValueType::Double,
    ValueType::Int,
    ValueType::Long,
    ValueType::Long,
    ValueType::Long,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateSchema,
    Populate,
    BatchOp,
    Query1,
    Query2,
    Query3,
    Disconnect,
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateSchema => "CreateSchema",
            Self::Populate => "Populate",
            Self::BatchOp => "BatchOp",
            Self::Query1 => "Q1",
            Self::Query2 => "Q2",
            Self::Query3 => "Q3",
            Self::Disconnect => "Disconnect",
        };

        f.write_str(name)
    }
}

impl CommandKind {
    pub const ALL: [Self; 7] = [
        Self::CreateSchema,
        Self::Populate,
        Self::BatchOp,
        Self::Query1,
        Self::Query2,
        Self::Query3,
        Self::Disconnect,
    ];

    pub const fn from_tag(tag: i32) -> Result<Self, ProtocolError> {
        Ok(match tag {
            1 => Self::CreateSchema,
            2 => Self::Populate,
            3 => Self::BatchOp,
            4 => Self::Query1,
            5 => Self::Query2,
            6 => Self::Query3,
            7 => Self::Disconnect,
            other => return Err(ProtocolError::UnknownCommandKind(other)),
        })
    }

    #[must_use]
    pub const fn tag(self) -> i32 {
        match self {
            Self::CreateSchema => 1,
            Self::Populate => 2,
            Self::BatchOp => 3,
            Self::Query1 => 4,
            Self::Query2 => 5,
            Self::Query3 => 6,
            Self::Disconnect => 7,
        }
    }

    /// Types of the arguments following the kind tag, in wire order.
    #[must_use]
    pub const fn arg_layout(self) -> &'static [ValueType] {
        match self {
            Self::CreateSchema => &[ValueType::Int],
            Self::Populate => &[ValueType::Long, ValueType::Long],
            Self::BatchOp => &BATCH_ARGS,
            Self::Query1 | Self::Query2 | Self::Query3 | Self::Disconnect => &[],
        }
    }

    /// Result values a response carries between its message and its elapsed
    /// time. `None` for kinds that are never answered.
    #[must_use]
    pub const fn response_extras(self) -> Option<&'static [ValueType]> {
        match self {
            Self::BatchOp => Some(&[ValueType::Long, ValueType::Long]),
            Self::CreateSchema | Self::Populate | Self::Query1 | Self::Query2 | Self::Query3 => {
                Some(&[])
            }
            Self::Disconnect => None,
        }
    }

    /// Schema creation is the only answered kind whose response carries no elapsed time.
    #[must_use]
    pub const fn reports_elapsed(self) -> bool {
        !matches!(self, Self::CreateSchema | Self::Disconnect)
    }

    /// Length of a complete frame of this kind.
    #[must_use]
    pub fn frame_len(self) -> usize {
        COMMAND_HEADER_LEN
            + self
                .arg_layout()
                .iter()
                .filter_map(|value_type| value_type.fixed_width())
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateSchema { num_columns: i32 },
    Populate { start: i64, end: i64 },
    BatchOp(BatchParams),
    Query1,
    Query2,
    Query3,
    Disconnect,
}

impl Command {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::CreateSchema { .. } => CommandKind::CreateSchema,
            Self::Populate { .. } => CommandKind::Populate,
            Self::BatchOp(_) => CommandKind::BatchOp,
            Self::Query1 => CommandKind::Query1,
            Self::Query2 => CommandKind::Query2,
            Self::Query3 => CommandKind::Query3,
            Self::Disconnect => CommandKind::Disconnect,
        }
    }

    #[must_use]
    pub fn args(&self) -> Vec<TypedValue> {
        match self {
            Self::CreateSchema { num_columns } => vec![TypedValue::Int(*num_columns)],
            Self::Populate { start, end } => vec![TypedValue::Long(*start), TypedValue::Long(*end)],
            Self::BatchOp(params) => vec![
                TypedValue::Int(params.num_ops),
                TypedValue::Double(params.insert_prob),
                TypedValue::Double(params.delete_prob),
                TypedValue::Double(params.update_prob),
                TypedValue::Int(params.client_id),
                TypedValue::Long(params.num_clients),
                TypedValue::Long(params.base_insert_key),
                TypedValue::Long(params.base_delete_key),
            ],
            Self::Query1 | Self::Query2 | Self::Query3 | Self::Disconnect => vec![],
        }
    }

    pub fn from_args(kind: CommandKind, args: &[TypedValue]) -> Result<Self, ProtocolError> {
        use TypedValue::{Double, Int, Long};

        Ok(match (kind, args) {
            (CommandKind::CreateSchema, [Int(num_columns)]) => Self::CreateSchema {
                num_columns: *num_columns,
            },
            (CommandKind::Populate, [Long(start), Long(end)]) => Self::Populate {
                start: *start,
                end: *end,
            },
            (
                CommandKind::BatchOp,
                [
                    Int(num_ops),
                    Double(insert_prob),
                    Double(delete_prob),
                    Double(update_prob),
                    Int(client_id),
                    Long(num_clients),
                    Long(base_insert_key),
                    Long(base_delete_key),
                ],
            ) => Self::BatchOp(BatchParams {
                num_ops: *num_ops,
                insert_prob: *insert_prob,
                delete_prob: *delete_prob,
                update_prob: *update_prob,
                client_id: *client_id,
                num_clients: *num_clients,
                base_insert_key: *base_insert_key,
                base_delete_key: *base_delete_key,
            }),
            (CommandKind::Query1, []) => Self::Query1,
            (CommandKind::Query2, []) => Self::Query2,
            (CommandKind::Query3, []) => Self::Query3,
            (CommandKind::Disconnect, []) => Self::Disconnect,
            (kind, _) => return Err(ProtocolError::UnexpectedArguments(kind)),
        })
    }
}

/// Decodes the first command in `bytes`.
///
/// Returns `Ok(None)` while the frame is incomplete, otherwise the command and
/// the number of bytes it occupied. The declared size is checked against the
/// kind's layout as soon as the header is available, so a corrupt frame is
/// rejected without waiting for bytes that will never arrive.
pub fn decode_command(bytes: &[u8]) -> Result<Option<(Command, usize)>, ProtocolError> {
    let Some(declared) = read_size(bytes) else {
        return Ok(None);
    };
    let Some(tag) = bytes.get(SIZE_LEN..COMMAND_HEADER_LEN) else {
        return Ok(None);
    };

    let mut reader = ByteReader::new(tag);
    let kind = CommandKind::from_tag(reader.read_i32()?)?;

    let expected = kind.frame_len();
    if usize::try_from(declared).ok() != Some(expected) {
        return Err(ProtocolError::SizeMismatch {
            kind,
            declared,
            expected,
        });
    }

    let Some(frame) = bytes.get(COMMAND_HEADER_LEN..expected) else {
        return Ok(None);
    };

    let mut reader = ByteReader::new(frame);
    let args = kind
        .arg_layout()
        .iter()
        .map(|value_type| TypedValue::decode(*value_type, &mut reader))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some((Command::from_args(kind, &args)?, expected)))
}

pub fn encode_command(command: &Command, out: &mut Vec<u8>) {
    let kind = command.kind();
    let size = i64::try_from(kind.frame_len()).unwrap_or(i64::MAX);

    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&kind.tag().to_le_bytes());
    for arg in command.args() {
        arg.encode(out);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn batch() -> Command {
        Command::BatchOp(BatchParams {
            num_ops: 100,
            insert_prob: 0.4,
            delete_prob: 0.3,
            update_prob: 0.3,
            client_id: 0,
            num_clients: 1,
            base_insert_key: 999,
            base_delete_key: 0,
        })
    }

    fn commands() -> Vec<Command> {
        vec![
            Command::CreateSchema { num_columns: 10 },
            Command::Populate {
                start: i64::MIN,
                end: i64::MAX,
            },
            batch(),
            Command::Query1,
            Command::Query2,
            Command::Query3,
            Command::Disconnect,
        ]
    }

    fn encoded(command: &Command) -> Vec<u8> {
        let mut bytes = vec![];
        encode_command(command, &mut bytes);

        bytes
    }

    #[test]
    fn tags_round_trip() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_tag(kind.tag()), Ok(kind));
        }
    }

    #[test]
    fn argument_free_frame_is_twelve_bytes() {
        assert_eq!(
            encoded(&Command::Query1),
            vec![12, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0]
        );
    }

    #[test]
    fn create_schema_layout() {
        let mut expected = 16i64.to_le_bytes().to_vec();
        expected.extend_from_slice(&1i32.to_le_bytes());
        expected.extend_from_slice(&3i32.to_le_bytes());

        assert_eq!(encoded(&Command::CreateSchema { num_columns: 3 }), expected);
    }

    #[test]
    fn frame_lengths() {
        assert_eq!(CommandKind::Populate.frame_len(), 28);
        assert_eq!(CommandKind::BatchOp.frame_len(), 12 + 4 + 24 + 4 + 24);
        assert_eq!(encoded(&batch()).len(), CommandKind::BatchOp.frame_len());
    }

    #[test]
    fn every_command_survives_encoding() {
        for command in commands() {
            let bytes = encoded(&command);

            assert_eq!(decode_command(&bytes), Ok(Some((command, bytes.len()))));
        }
    }

    #[test]
    fn partial_frames_are_incomplete_at_every_length() {
        for command in commands() {
            let bytes = encoded(&command);

            for len in 0..bytes.len() {
                assert_eq!(decode_command(&bytes[..len]), Ok(None), "{command:?} at {len}");
            }
        }
    }

    #[test]
    fn back_to_back_frames_decode_one_at_a_time() {
        let mut bytes = encoded(&Command::Populate { start: 0, end: 10 });
        bytes.extend(encoded(&Command::Query2));

        let (first, used) = decode_command(&bytes).unwrap().unwrap();
        assert_eq!(first, Command::Populate { start: 0, end: 10 });

        let (second, rest) = decode_command(&bytes[used..]).unwrap().unwrap();
        assert_eq!(second, Command::Query2);
        assert_eq!(used + rest, bytes.len());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = 12i64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&42i32.to_le_bytes());

        assert_eq!(
            decode_command(&bytes),
            Err(ProtocolError::UnknownCommandKind(42))
        );
    }

    #[test]
    fn declared_size_must_match_the_layout() {
        let mut bytes = encoded(&Command::CreateSchema { num_columns: 1 });
        bytes[..8].copy_from_slice(&100i64.to_le_bytes());

        // rejected from the header alone
        assert_eq!(
            decode_command(&bytes[..12]),
            Err(ProtocolError::SizeMismatch {
                kind: CommandKind::CreateSchema,
                declared: 100,
                expected: 16,
            })
        );
    }

    #[test]
    fn negative_size_is_rejected() {
        let mut bytes = encoded(&Command::Disconnect);
        bytes[..8].copy_from_slice(&(-1i64).to_le_bytes());

        assert!(matches!(
            decode_command(&bytes),
            Err(ProtocolError::SizeMismatch { declared: -1, .. })
        ));
    }

    #[test]
    fn mismatched_arguments_are_rejected() {
        assert_eq!(
            Command::from_args(CommandKind::Populate, &[TypedValue::Int(1)]),
            Err(ProtocolError::UnexpectedArguments(CommandKind::Populate))
        );
        assert_eq!(
            Command::from_args(CommandKind::Query1, &[TypedValue::Bool(true)]),
            Err(ProtocolError::UnexpectedArguments(CommandKind::Query1))
        );
    }
}
