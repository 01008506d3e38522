//! Protocol buffer messages
//!
//! Declared by hand with `prost` derives; there is no build-time codegen.

/// Subset of Riemann's `proto.proto` used for pushing events
pub mod riemann {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Msg {
        #[prost(bool, optional, tag = "2")]
        pub ok: Option<bool>,
        #[prost(string, optional, tag = "3")]
        pub error: Option<String>,
        #[prost(message, repeated, tag = "6")]
        pub events: Vec<Event>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Event {
        /// Epoch seconds
        #[prost(int64, optional, tag = "1")]
        pub time: Option<i64>,
        #[prost(string, optional, tag = "2")]
        pub state: Option<String>,
        #[prost(string, optional, tag = "3")]
        pub service: Option<String>,
        #[prost(string, optional, tag = "4")]
        pub host: Option<String>,
        #[prost(string, optional, tag = "5")]
        pub description: Option<String>,
        #[prost(string, repeated, tag = "7")]
        pub tags: Vec<String>,
        #[prost(float, optional, tag = "8")]
        pub ttl: Option<f32>,
        #[prost(message, repeated, tag = "9")]
        pub attributes: Vec<Attribute>,
        #[prost(sint64, optional, tag = "13")]
        pub metric_sint64: Option<i64>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Attribute {
        #[prost(string, required, tag = "1")]
        pub key: String,
        #[prost(string, optional, tag = "2")]
        pub value: Option<String>,
    }
}
