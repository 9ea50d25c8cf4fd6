//! Messages and method descriptors of the `pb.Motoko` service.
//!
//! Field tags follow `types.proto`. Enum-typed fields are carried as raw
//! `i32` values.

use crate::stream::transport::{MethodDescriptor, MethodKind};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "pb.Motoko";

/// Infers dataset metadata from uploaded CSV data.
pub const INFER: MethodDescriptor =
    MethodDescriptor::new(SERVICE_NAME, "Infer", MethodKind::ClientStreaming);
/// Trains a model on uploaded CSV data.
pub const LEARN: MethodDescriptor =
    MethodDescriptor::new(SERVICE_NAME, "Learn", MethodKind::ClientStreaming);
/// Streams predictions for uploaded CSV data.
pub const PREDICT: MethodDescriptor =
    MethodDescriptor::new(SERVICE_NAME, "Predict", MethodKind::Bidirectional);
/// Bidirectional form of [`INFER`] used by browser clients.
pub const WEB_INFER: MethodDescriptor =
    MethodDescriptor::new(SERVICE_NAME, "WebInfer", MethodKind::Bidirectional);
/// Bidirectional form of [`LEARN`] used by browser clients.
pub const WEB_LEARN: MethodDescriptor =
    MethodDescriptor::new(SERVICE_NAME, "WebLearn", MethodKind::Bidirectional);

/// One column of a dataset.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Attribute {
    /// Column header.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// `BehaviorType` enum value, eg categorical or numerical.
    #[prost(int32, tag = "2")]
    pub behavior_type: i32,
    /// `DataType` enum value, eg integer, float, or string.
    #[prost(int32, tag = "3")]
    pub data_type: i32,
}

/// Dataset description produced by `Infer` and consumed by `Learn`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    /// True when one column is the prediction target.
    #[prost(bool, tag = "1")]
    pub has_target: bool,
    /// Name of the target column.
    #[prost(string, tag = "2")]
    pub target_name: ::prost::alloc::string::String,
    /// Columns in file order.
    #[prost(message, repeated, tag = "3")]
    pub attributes: ::prost::alloc::vec::Vec<Attribute>,
}

/// Request message for `Infer`: one `Parameters` header, then data chunks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InferRequest {
    /// Header or data chunk.
    #[prost(oneof = "infer_request::Value", tags = "1, 2")]
    pub value: ::core::option::Option<infer_request::Value>,
}

/// Nested types of [`InferRequest`](super::InferRequest).
pub mod infer_request {
    /// Tuning of the type inference.
    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Parameters {
        /// Share of values that may fail to parse in a numeric column.
        #[prost(float, tag = "1")]
        pub numeric_error_threshold: f32,
        /// Most distinct values a categorical column may have.
        #[prost(int32, tag = "2")]
        pub n_max_categories: i32,
    }

    /// Content of one [`InferRequest`](super::InferRequest).
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        /// Header, sent first.
        #[prost(message, tag = "1")]
        Parameters(Parameters),
        /// Raw CSV bytes.
        #[prost(bytes, tag = "2")]
        Data(::prost::alloc::vec::Vec<u8>),
    }
}

/// Response of `Infer`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InferResponse {
    /// Inferred description of the uploaded dataset.
    #[prost(message, optional, tag = "1")]
    pub metadata: ::core::option::Option<Metadata>,
}

/// Request message for `Learn`: one `Metadata` header, then data chunks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LearnRequest {
    /// Header or data chunk.
    #[prost(oneof = "learn_request::Value", tags = "1, 2")]
    pub value: ::core::option::Option<learn_request::Value>,
}

/// Nested types of [`LearnRequest`](super::LearnRequest).
pub mod learn_request {
    /// Content of one [`LearnRequest`](super::LearnRequest).
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        /// Header, sent first.
        #[prost(message, tag = "1")]
        Metadata(super::Metadata),
        /// Raw CSV bytes.
        #[prost(bytes, tag = "2")]
        Data(::prost::alloc::vec::Vec<u8>),
    }
}

/// Response of `Learn`. `evaluation` and `decisions` are JSON documents.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LearnResponse {
    /// Key of the trained model.
    #[prost(string, tag = "1")]
    pub learn_key: ::prost::alloc::string::String,
    /// Performance metrics as JSON.
    #[prost(string, tag = "2")]
    pub evaluation: ::prost::alloc::string::String,
    /// Decisions taken while learning, as JSON.
    #[prost(string, tag = "3")]
    pub decisions: ::prost::alloc::string::String,
}

/// Request message for `Predict`: the learn key, then data chunks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PredictRequest {
    /// Header or data chunk.
    #[prost(oneof = "predict_request::Value", tags = "1, 2")]
    pub value: ::core::option::Option<predict_request::Value>,
}

/// Nested types of [`PredictRequest`](super::PredictRequest).
pub mod predict_request {
    /// Content of one [`PredictRequest`](super::PredictRequest).
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        /// Header, sent first.
        #[prost(string, tag = "1")]
        LearnKey(::prost::alloc::string::String),
        /// Raw CSV bytes.
        #[prost(bytes, tag = "2")]
        Data(::prost::alloc::vec::Vec<u8>),
    }
}

/// One fragment of the JSON encoded predictions or decisions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PredictResponse {
    /// Which document the fragment belongs to.
    #[prost(oneof = "predict_response::Value", tags = "1, 2")]
    pub value: ::core::option::Option<predict_response::Value>,
}

/// Nested types of [`PredictResponse`](super::PredictResponse).
pub mod predict_response {
    /// Content of one [`PredictResponse`](super::PredictResponse).
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        /// Fragment of the predictions document.
        #[prost(string, tag = "1")]
        Predictions(::prost::alloc::string::String),
        /// Fragment of the decisions document.
        #[prost(string, tag = "2")]
        Decisions(::prost::alloc::string::String),
    }
}

impl InferRequest {
    /// Header message carrying the inference parameters.
    pub fn parameters(parameters: infer_request::Parameters) -> Self {
        Self {
            value: Some(infer_request::Value::Parameters(parameters)),
        }
    }

    /// Data message carrying one chunk of CSV bytes.
    pub fn data(chunk: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(infer_request::Value::Data(chunk.into())),
        }
    }
}

impl LearnRequest {
    /// Header message carrying the dataset description.
    pub fn metadata(metadata: Metadata) -> Self {
        Self {
            value: Some(learn_request::Value::Metadata(metadata)),
        }
    }

    /// Data message carrying one chunk of CSV bytes.
    pub fn data(chunk: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(learn_request::Value::Data(chunk.into())),
        }
    }
}

impl PredictRequest {
    /// Header message naming the model to predict with.
    pub fn learn_key(learn_key: impl Into<String>) -> Self {
        Self {
            value: Some(predict_request::Value::LearnKey(learn_key.into())),
        }
    }

    /// Data message carrying one chunk of CSV bytes.
    pub fn data(chunk: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(predict_request::Value::Data(chunk.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::{infer_request, InferRequest, LearnRequest, Metadata, PREDICT, WEB_LEARN};

    #[test]
    fn descriptors_match_service_shape() {
        assert!(PREDICT.is_bidirectional());
        assert_eq!(WEB_LEARN.path(), "/pb.Motoko/WebLearn");
        assert!(!super::LEARN.is_bidirectional());
    }

    #[test]
    fn data_chunks_use_field_two() {
        let encoded = InferRequest::data(vec![1u8, 2, 3]).encode_to_vec();
        assert_eq!(encoded, vec![0x12, 0x03, 1, 2, 3]);
    }

    #[test]
    fn header_messages_decode_back_to_their_variant() {
        let header = LearnRequest::metadata(Metadata {
            has_target: true,
            target_name: "species".to_string(),
            attributes: Vec::new(),
        });
        let decoded = LearnRequest::decode(header.encode_to_vec().as_slice()).expect("decode");
        assert_eq!(decoded, header);

        let parameters = InferRequest::parameters(infer_request::Parameters {
            numeric_error_threshold: 0.05,
            n_max_categories: 25,
        });
        assert!(matches!(
            InferRequest::decode(parameters.encode_to_vec().as_slice())
                .expect("decode")
                .value,
            Some(infer_request::Value::Parameters(_))
        ));
    }
}
