//! WhatsApp Cloud API client

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use whatsend_common::config::WhatsAppConfig;
use whatsend_common::types::TemplateDefinition;

use super::{MessagingProvider, ProviderError, SendReceipt, TemplatePayload, TemplateSource};

/// Error envelope returned by the Graph API
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TemplateList {
    #[serde(default)]
    data: Vec<TemplateDefinition>,
}

/// Graph API client for one sending phone number
#[derive(Clone)]
pub struct CloudApiClient {
    client: Client,
    base_url: String,
    phone_number_id: String,
    business_account_id: String,
    access_token: String,
    timeout: Duration,
}

impl CloudApiClient {
    /// Create a new client
    pub fn new(config: &WhatsAppConfig) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!(
                "{}/{}",
                config.api_base_url.trim_end_matches('/'),
                config.api_version
            ),
            phone_number_id: config.phone_number_id.clone(),
            business_account_id: config.business_account_id.clone(),
            access_token: config.access_token.clone(),
            timeout,
        })
    }

    fn build_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        self.client
            .request(method, &url)
            .bearer_auth(&self.access_token)
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Network(e.to_string())
        }
    }

    /// Turn a non-success response into an API error
    async fn api_error(status: StatusCode, response: reqwest::Response) -> ProviderError {
        let body = response.text().await.unwrap_or_default();
        let (message, code) = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => (envelope.error.message, envelope.error.code),
            Err(_) => (body, None),
        };
        ProviderError::Api {
            status: status.as_u16(),
            code,
            message,
        }
    }

    async fn post_message(&self, body: serde_json::Value) -> Result<SendReceipt, ProviderError> {
        let response = self
            .build_request(Method::POST, &format!("{}/messages", self.phone_number_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let err = Self::api_error(status, response).await;
            warn!("WhatsApp send rejected: {}", err);
            return Err(err);
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let message_id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| ProviderError::InvalidResponse("response has no message id".into()))?;

        debug!(message_id = %message_id, "WhatsApp message accepted");
        Ok(SendReceipt { message_id })
    }
}

#[async_trait]
impl MessagingProvider for CloudApiClient {
    async fn send_template_message(
        &self,
        phone: &str,
        template: &TemplatePayload,
    ) -> Result<SendReceipt, ProviderError> {
        let mut body = json!({
            "messaging_product": "whatsapp",
            "to": phone,
            "type": "template",
            "template": {
                "name": template.name,
                "language": { "code": template.language },
            },
        });
        if !template.components.is_empty() {
            body["template"]["components"] = serde_json::to_value(&template.components)
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        }

        self.post_message(body).await
    }

    async fn send_text_message(
        &self,
        phone: &str,
        body: &str,
    ) -> Result<SendReceipt, ProviderError> {
        self.post_message(json!({
            "messaging_product": "whatsapp",
            "to": phone,
            "type": "text",
            "text": { "body": body },
        }))
        .await
    }
}

#[async_trait]
impl TemplateSource for CloudApiClient {
    async fn fetch_template(
        &self,
        name: &str,
        language: Option<&str>,
    ) -> Result<Option<TemplateDefinition>, ProviderError> {
        let response = self
            .build_request(
                Method::GET,
                &format!("{}/message_templates", self.business_account_id),
            )
            .query(&[("name", name), ("limit", "50")])
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::api_error(status, response).await);
        }

        let list: TemplateList = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        // The name filter is a prefix match on the Graph API
        let mut candidates = list.data.into_iter().filter(|t| t.name == name);
        let template = match language {
            Some(language) => {
                let candidates: Vec<_> = candidates.collect();
                let exact = candidates.iter().position(|t| t.language == language);
                match exact {
                    Some(index) => candidates.into_iter().nth(index),
                    None => candidates.into_iter().next(),
                }
            }
            None => candidates.next(),
        };

        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{ComponentParameters, Parameter};
    use pretty_assertions::assert_eq;
    use whatsend_common::types::ComponentKind;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> CloudApiClient {
        let config = WhatsAppConfig {
            api_base_url: server.uri(),
            phone_number_id: "1001".to_string(),
            business_account_id: "2002".to_string(),
            access_token: "secret-token".to_string(),
            ..WhatsAppConfig::default()
        };
        CloudApiClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_send_template_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v19.0/1001/messages"))
            .and(header("authorization", "Bearer secret-token"))
            .and(body_partial_json(serde_json::json!({
                "to": "5511999990000",
                "type": "template",
                "template": {
                    "name": "order_update",
                    "language": {"code": "es"},
                    "components": [
                        {"type": "body", "parameters": [{"type": "text", "text": "Ana"}]}
                    ]
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "messages": [{"id": "wamid.abc"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let payload = TemplatePayload {
            name: "order_update".to_string(),
            language: "es".to_string(),
            components: vec![ComponentParameters {
                kind: ComponentKind::Body,
                parameters: vec![Parameter::text("Ana")],
            }],
        };
        let receipt = client(&server)
            .send_template_message("5511999990000", &payload)
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "wamid.abc");
    }

    #[tokio::test]
    async fn test_error_envelope_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v19.0/1001/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Invalid parameter", "code": 100}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .send_text_message("5511999990000", "hello")
            .await
            .unwrap_err();
        match &err {
            ProviderError::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(*status, 400);
                assert_eq!(*code, Some(100));
                assert_eq!(message, "Invalid parameter");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let err = client(&server)
            .send_text_message("5511999990000", "hello")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_template_prefers_language() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v19.0/2002/message_templates"))
            .and(query_param("name", "order_update"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"name": "order_update_v2", "language": "es", "components": []},
                    {"name": "order_update", "language": "en_US", "status": "APPROVED",
                     "components": [{"type": "BODY", "text": "Hi {{1}}"}]},
                    {"name": "order_update", "language": "es", "status": "APPROVED",
                     "components": [{"type": "BODY", "text": "Hola {{1}}"}]}
                ]
            })))
            .mount(&server)
            .await;

        let api = client(&server);
        let template = api
            .fetch_template("order_update", Some("es"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(template.language, "es");
        assert_eq!(template.components[0].text.as_deref(), Some("Hola {{1}}"));

        assert!(api
            .fetch_template("order_update_v3", None)
            .await
            .unwrap()
            .is_none());
    }
}
