//! Native operation set
//!
//! [`NativeMqtt`] is the single collaborator contract of the client state
//! machine. Every operation is a fire-and-forget request: a synchronous
//! `Err` means the request could not even be queued, while the real outcome
//! arrives later as a named event through the [`EventRouter`](crate::router::EventRouter)
//! the implementation was constructed with.
//!
//! | Operation | Outcome events |
//! |---|---|
//! | `create_mqtt` | `{clientId}client_initialize` |
//! | `connect_mqtt` | `{clientId}connected` / `{clientId}disconnected` |
//! | `disconnect_mqtt` | `{clientId}disconnected` |
//! | `subscribe_mqtt` | `{subscriptionId}subscribe_success` / `subscribe_failed`, then messages on `{subscriptionId}` |
//! | `unsubscribe_mqtt` | `{clientId}mqtt_error` on failure |

pub mod rumqttc_native;

pub use crate::error::{NativeError, NativeOperation};
pub use rumqttc_native::RumqttcNative;

use crate::protocol::{ConnectionStatus, NativeConnectOptions, Qos, SubscriptionId};

pub type NativeResult = Result<(), NativeError>;

pub trait NativeMqtt: Send + Sync {
    /// Construct the native client for `client_id`
    fn create_mqtt(&self, client_id: &str, host: &str, port: u16, enable_ssl: bool) -> NativeResult;

    /// Tear down the native client and forget its subscriptions
    fn remove_mqtt(&self, client_id: &str) -> NativeResult;

    fn connect_mqtt(&self, client_id: &str, options: &NativeConnectOptions) -> NativeResult;

    fn disconnect_mqtt(&self, client_id: &str) -> NativeResult;

    /// Subscribe one logical subscription; several ids may share a topic
    fn subscribe_mqtt(
        &self,
        subscription_id: &SubscriptionId,
        client_id: &str,
        topic: &str,
        qos: Qos,
    ) -> NativeResult;

    /// Release one logical subscription; the broker is only told once the
    /// last id of the topic is gone
    fn unsubscribe_mqtt(
        &self,
        subscription_id: &SubscriptionId,
        client_id: &str,
        topic: &str,
    ) -> NativeResult;

    /// Live status as seen by the native layer
    fn connection_status_mqtt(&self, client_id: &str) -> ConnectionStatus;
}
