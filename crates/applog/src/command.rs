/// A single client command, as carried on the wire, through consensus,
/// and into the application log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    /// Application-log index, assigned by the state machine at record time.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(enumeration = "Operation", tag = "2")]
    pub op_code: i32,
    #[prost(string, tag = "3")]
    pub key: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub value: ::prost::alloc::vec::Vec<u8>,
    /// The UDP port on which the issuing client awaits its reply.
    #[prost(string, tag = "5")]
    pub ip: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Operation {
    Get = 0,
    Set = 1,
}

impl Command {
    /// Returns the operation, defaulting to `Get` for out-of-range values.
    pub fn op(&self) -> Operation {
        Operation::try_from(self.op_code).unwrap_or(Operation::Get)
    }

    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op_code: Operation::Set as i32,
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self {
            op_code: Operation::Get as i32,
            key: key.into(),
            ..Default::default()
        }
    }
}
