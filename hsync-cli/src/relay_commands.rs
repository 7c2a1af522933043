use crate::config::SendCommand;
use crate::console_host::ConsoleHost;
use anyhow::anyhow;
use hsync_p2p::{Delivery, OutNode};
use libhsync::message::{PAYLOAD_FIELD, QUERY_FIELD, TOPIC_FIELD};
use libhsync::BridgeConfig;
use serde_json::{Map, Value};
use std::path::Path;

/// Build the flow message an out node expects: `{topic?, payload, query?}`.
pub fn flow_message(topic: Option<String>, payload: &str, query: &[(String, String)]) -> Value {
    let payload = serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
    let mut message = Map::new();
    if let Some(topic) = topic {
        message.insert(TOPIC_FIELD.to_string(), Value::String(topic));
    }
    message.insert(PAYLOAD_FIELD.to_string(), payload);
    if !query.is_empty() {
        let query = query.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect::<Map<_, _>>();
        message.insert(QUERY_FIELD.to_string(), Value::Object(query));
    }
    Value::Object(message)
}

/// The relay base address and default topic for a send command.
fn target(cmd: &SendCommand, config_file: Option<&Path>) -> Result<(String, Option<String>), anyhow::Error> {
    match (&cmd.relay, &cmd.base) {
        (Some(name), _) => {
            let config = BridgeConfig::try_load(config_file)?;
            let relay = config.relay(name)?;
            Ok((relay.base.clone(), relay.topic.clone()))
        }
        (None, Some(base)) => Ok((base.clone(), None)),
        (None, None) => Err(anyhow!("Either a relay name or a base address is required.")),
    }
}

pub async fn send(cmd: SendCommand, config_file: Option<&Path>) -> Result<(), anyhow::Error> {
    let (base, default_topic) = target(&cmd, config_file)?;
    let message = flow_message(cmd.topic.clone().or(default_topic), &cmd.payload, &cmd.query);
    let node = OutNode::relay(&base)?;
    let host = ConsoleHost::new("relay");
    match node.on_input(&message, &host).await? {
        Delivery::Relayed => println!("Message delivered to {base}"),
        other => println!("Message not relayed ({other:?})"),
    }
    Ok(())
}
