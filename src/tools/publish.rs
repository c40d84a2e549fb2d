use std::sync::Arc;

use serde_json::json;

use crate::error::ToolError;
use crate::notify::Notifier;
use crate::tools::{ToolOutcome, ToolSpec, string_arg};

pub const PUBLISH_NOTIFICATION_TOOL: &str = "publish_notification";

/// Lets the model publish a message through the registered `Arc<dyn Notifier>`.
pub fn publish_notification_tool() -> ToolSpec {
    ToolSpec::new(PUBLISH_NOTIFICATION_TOOL, "Publish a text message to the notification topic")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Message body to publish"}
            },
            "required": ["text"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(|args, deps| {
            let text = string_arg(PUBLISH_NOTIFICATION_TOOL, &args, "text");
            let notifier = deps.get::<Arc<dyn Notifier>>();

            async move {
                let text = text?;
                let notifier = notifier.ok_or(ToolError::MissingDependency("Notifier"))?;
                notifier
                    .publish(&text)
                    .await
                    .map_err(|err| ToolError::Execution(err.to_string()))?;
                Ok(ToolOutcome::Text(format!(
                    "Published notification ({} chars)",
                    text.chars().count()
                )))
            }
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::NotifyError;
    use crate::tools::DependencyMap;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn publish(&self, message: &str) -> Result<(), NotifyError> {
            self.messages
                .lock()
                .expect("lock poisoned")
                .push(message.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_through_registered_notifier() {
        let recorder = Arc::new(Recorder::default());
        let deps = DependencyMap::new();
        deps.insert::<Arc<dyn Notifier>>(recorder.clone());

        let outcome = publish_notification_tool()
            .execute(json!({"text": "検索結果"}), &deps)
            .await
            .expect("publish succeeds");

        assert_eq!(
            outcome,
            ToolOutcome::Text("Published notification (4 chars)".to_string())
        );
        assert_eq!(
            *recorder.messages.lock().expect("lock poisoned"),
            vec!["検索結果".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_notifier_is_reported() {
        let err = publish_notification_tool()
            .execute(json!({"text": "hi"}), &DependencyMap::new())
            .await
            .expect_err("no notifier");
        assert!(matches!(err, ToolError::MissingDependency("Notifier")));
    }
}
