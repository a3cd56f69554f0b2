/**
 * dialog/establisher.rs
 *
 * Consumer side of the dialog handshake
 */

use super::{
    Dialog, DialogCreateRequest, DialogCreateResponse, DialogError, SecuredCodec,
    DIALOG_VERSION_V1, ENDPOINT_DIALOG_CREATE, REASON_OK,
};
use crate::communication::{
    Codec, Contact, JsonCodec, Sender, TopicAddress, TransportError, DEFAULT_REQUEST_TIMEOUT,
};
use crate::identity::{Identity, Signer, VerifierFactory};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Resolves a peer contact into the address its waiter listens on
pub type AddressFactory = Arc<dyn Fn(&Contact) -> Result<TopicAddress, TransportError> + Send + Sync>;

pub struct DialogEstablisher {
    id: Identity,
    signer: Arc<dyn Signer>,
    verifiers: VerifierFactory,
    address_factory: AddressFactory,
    timeout: Duration,
    version: Option<String>,
}

impl DialogEstablisher {
    pub fn new(signer: Arc<dyn Signer>, verifiers: VerifierFactory) -> Self {
        Self {
            id: signer.identity(),
            signer,
            verifiers,
            address_factory: Arc::new(TopicAddress::for_contact),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            version: Some(DIALOG_VERSION_V1.to_string()),
        }
    }

    pub fn with_address_factory(mut self, factory: AddressFactory) -> Self {
        self.address_factory = factory;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Omit the request version, asking the waiter for the fixed
    /// `<topic>.<own identity>` dialog topic instead of a random one
    pub fn with_fixed_topic(mut self) -> Self {
        self.version = None;
        self
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    /// Perform the handshake with `peer_id`. No retries happen here.
    pub async fn establish_dialog(
        &self,
        peer_id: &Identity,
        contact: &Contact,
    ) -> Result<Dialog, DialogError> {
        let mut address = (self.address_factory)(contact)?;
        address.connect().await?;

        info!(peer = %peer_id, topic = %address.topic(), "establishing dialog");

        let codec: Arc<dyn Codec> = Arc::new(SecuredCodec::new(
            Arc::new(JsonCodec),
            self.signer.clone(),
            peer_id.clone(),
            (self.verifiers)(peer_id),
        ));

        let response = match self.create_dialog(&address, codec.clone()).await {
            Ok(response) => response,
            Err(e) => {
                warn!(peer = %peer_id, "dialog creation failed: {}", e);
                address.disconnect();
                return Err(e);
            }
        };

        let suffix = if response.topic.is_empty() {
            self.id.address.clone()
        } else {
            response.topic
        };
        let address = address.into_nested(&suffix);
        let dialog = Dialog::new(peer_id.clone(), address, codec)?;

        info!(peer = %peer_id, topic = %dialog.topic(), "dialog established");
        Ok(dialog)
    }

    async fn create_dialog(
        &self,
        address: &TopicAddress,
        codec: Arc<dyn Codec>,
    ) -> Result<DialogCreateResponse, DialogError> {
        let sender = Sender::new(address.connection()?, codec, address.topic()).with_timeout(self.timeout);
        let request = DialogCreateRequest {
            peer_id: self.id.clone(),
            version: self.version.clone(),
        };

        let response: DialogCreateResponse = sender.request(ENDPOINT_DIALOG_CREATE, &request).await?;
        if response.reason != REASON_OK {
            return Err(DialogError::Rejected {
                reason: response.reason,
                message: response.reason_message,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::{Connection, MemoryConnection};
    use crate::identity::{fake_verifier_factory, key_verifier_factory, FakeSigner, KeySigner};
    use tokio_test::{assert_err, assert_ok};

    fn fake_envelope(payload: &str) -> Vec<u8> {
        let signature = FakeSigner::default().sign(payload.as_bytes()).unwrap();
        format!(r#"{{"payload":{},"signature":"{}"}}"#, payload, signature.to_base64()).into_bytes()
    }

    fn establisher(
        connection: &MemoryConnection,
        signer: Arc<dyn Signer>,
        verifiers: VerifierFactory,
    ) -> DialogEstablisher {
        let connection: Arc<dyn Connection> = Arc::new(connection.clone());
        DialogEstablisher::new(signer, verifiers)
            .with_address_factory(Arc::new(
                move |_: &Contact| -> Result<TopicAddress, TransportError> {
                    Ok(TopicAddress::with_connection(connection.clone(), "peer-topic"))
                },
            ))
            .with_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn establishes_dialog_on_fixed_topic() {
        let my_id = Identity::from_address("0x6B21b441D0D2Fa1d86407977A3a5C6eD90Ff1A62");
        let peer_id = Identity::from_address("0x0d1a35e53b7f3478d00B7C23838C0D48b2a81017");
        let connection = MemoryConnection::new();
        connection.mock_response(
            "peer-topic.dialog-create",
            &fake_envelope(r#"{"reason":200,"reasonMessage":"OK"}"#),
        );

        let establisher = establisher(
            &connection,
            Arc::new(FakeSigner::new(my_id.clone())),
            fake_verifier_factory(),
        )
        .with_fixed_topic();
        assert_eq!(establisher.id(), &my_id);

        let dialog = assert_ok!(establisher.establish_dialog(&peer_id, &Contact::default()).await);
        assert_eq!(dialog.peer_id(), &peer_id);
        assert_eq!(dialog.topic(), format!("peer-topic.{}", my_id.address));
        assert_eq!(dialog.sender().topic(), dialog.topic());
        assert_eq!(dialog.receiver().topic(), dialog.topic());
        dialog.close().await;
    }

    #[tokio::test]
    async fn follows_redirected_topic() {
        let connection = MemoryConnection::new();
        connection.mock_response(
            "peer-topic.dialog-create",
            &fake_envelope(r#"{"reason":200,"reasonMessage":"OK","topic":"private"}"#),
        );

        let dialog = establisher(&connection, Arc::new(FakeSigner::default()), fake_verifier_factory())
            .establish_dialog(&Identity::from_address("0xaaa"), &Contact::default())
            .await
            .unwrap();
        assert_eq!(dialog.topic(), "peer-topic.private");
    }

    #[tokio::test]
    async fn hijacked_response_is_rejected() {
        let me = KeySigner::random();
        let peer = KeySigner::random();
        let hijacker = KeySigner::random();

        let payload = r#"{"reason":200,"reasonMessage":"OK"}"#;
        let signature = hijacker.sign(payload.as_bytes()).unwrap();
        let connection = MemoryConnection::new();
        connection.mock_response(
            "peer-topic.dialog-create",
            format!(r#"{{"payload":{},"signature":"{}"}}"#, payload, signature.to_base64()).as_bytes(),
        );

        let result = establisher(&connection, Arc::new(me), key_verifier_factory())
            .establish_dialog(&peer.identity(), &Contact::default())
            .await;
        let err = assert_err!(result);
        assert!(matches!(err, DialogError::Authentication(_)));
        assert!(err.to_string().contains(
            "dialog creation error. failed to unpack response 'peer-topic.dialog-create'. invalid message signature"
        ));
    }

    #[tokio::test]
    async fn rejection_carries_reason_message() {
        let connection = MemoryConnection::new();
        connection.mock_response(
            "peer-topic.dialog-create",
            &fake_envelope(r#"{"reason":400,"reasonMessage":"Invalid Identity"}"#),
        );

        let result = establisher(&connection, Arc::new(FakeSigner::default()), fake_verifier_factory())
            .establish_dialog(&Identity::from_address("0xaaa"), &Contact::default())
            .await;
        match result {
            Err(DialogError::Rejected { reason, message }) => {
                assert_eq!(reason, 400);
                assert_eq!(message, "Invalid Identity");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_waiter_times_out() {
        let connection = MemoryConnection::new();
        let result = establisher(&connection, Arc::new(FakeSigner::default()), fake_verifier_factory())
            .establish_dialog(&Identity::from_address("0xaaa"), &Contact::default())
            .await;
        let err = assert_err!(result);
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn unresolvable_contact_fails_before_sending() {
        let establisher = DialogEstablisher::new(Arc::new(FakeSigner::default()), fake_verifier_factory());
        let result = establisher
            .establish_dialog(&Identity::from_address("0xaaa"), &Contact::default())
            .await;
        assert!(matches!(result, Err(DialogError::Transport(TransportError::InvalidContact(_)))));
    }
}
