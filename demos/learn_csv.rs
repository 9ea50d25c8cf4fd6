use std::error::Error;
use std::sync::Arc;

use bytes::Bytes;
use motoko_sdk::stream::client::MotokoClient;
use motoko_sdk::stream::proto::{Attribute, LearnResponse, Metadata};
use motoko_sdk::stream::transport::{
    CallHandle, CallMetadata, CallStatus, MethodDescriptor, OpenCall, Transport, TransportEvent,
};
use motoko_sdk::upload::source::FileSource;
use prost::Message;
use tokio::sync::mpsc;

/// Answers every call with a fixed learn result once the upload is complete.
/// Replace with a transport backed by a real gRPC channel.
struct CannedTransport;

struct CannedCall {
    events: mpsc::UnboundedSender<TransportEvent>,
    received: usize,
}

impl CallHandle for CannedCall {
    fn start(&mut self, metadata: &CallMetadata) {
        println!("call started with {} metadata entries", metadata.len());
    }

    fn send(&mut self, message: Bytes) {
        self.received += message.len();
    }

    fn half_close(&mut self) {
        let response = LearnResponse {
            learn_key: "demo-learn-key".to_string(),
            evaluation: format!(r#"{{"bytes_received": {}}}"#, self.received),
            decisions: "[]".to_string(),
        };
        let _ = self
            .events
            .send(TransportEvent::Message(Bytes::from(response.encode_to_vec())));
        let _ = self.events.send(TransportEvent::Status(CallStatus::ok()));
    }

    fn abort(&mut self) {}
}

impl Transport for CannedTransport {
    fn open_call(&self, _method: &MethodDescriptor, _endpoint: &str) -> OpenCall {
        let (tx, events) = mpsc::unbounded_channel();
        OpenCall {
            handle: Box::new(CannedCall {
                events: tx,
                received: 0,
            }),
            events,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "REPLACE_WITH_CSV_PATH".to_string());
    let auth = CallMetadata::new()
        .with("email", "REPLACE_WITH_EMAIL")
        .with("api_key", "REPLACE_WITH_API_KEY");
    let dataset = Metadata {
        has_target: true,
        target_name: "species".to_string(),
        attributes: vec![Attribute {
            name: "species".to_string(),
            behavior_type: 1,
            data_type: 3,
        }],
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = MotokoClient::new(Arc::new(CannedTransport));
        let mut source = FileSource::open(&path).await?;

        let outcome = client
            .learn_source(auth, &mut source, dataset, |fraction| {
                println!("uploaded {:.0}%", fraction * 100.0)
            })
            .await?;

        println!(
            "learn_key={} evaluation={} decisions={}",
            outcome.learn_key, outcome.evaluation, outcome.decisions
        );
        Ok::<(), Box<dyn Error>>(())
    })
}
