//! Gmail API connector.
//!
//! API base: `https://gmail.googleapis.com/gmail/v1`

use std::path::{Component, Path, PathBuf};

use chrono::{TimeZone, Utc};
use log::{debug, info};
use serde::Deserialize;

use stormware_core::config::expand_home;
use stormware_gcp::{scopes, GcpAuth, GcpClient, GcpError, GcpResult};

use crate::types::{decode_base64_url, Address, Attachment, Label, Message, MessagePart, Query};

const SERVICE: &str = "gmail";
const DEFAULT_USER: &str = "me";

/// Field mask of `users.messages.get`.
const MESSAGE_FIELDS: &str = "id, threadId, labelIds, internalDate, \
    payload(partId, headers, mimeType, filename, body(data), \
    parts(partId, mimeType, filename, body(data, attachmentId), \
    parts(partId, mimeType, filename, body(data))))";

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    internal_date: Option<String>,
    #[serde(default)]
    payload: MessagePart,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    #[serde(default)]
    data: String,
}

/// Read-only Gmail connector.
///
/// The credentials must be authorized for the
/// `https://www.googleapis.com/auth/gmail.readonly` scope.
#[derive(Debug, Clone)]
pub struct Gmail {
    client: GcpClient,
    user_id: String,
}

impl Gmail {
    pub fn new(client: GcpClient) -> Self {
        Self {
            client,
            user_id: DEFAULT_USER.to_string(),
        }
    }

    pub async fn connect(
        auth: &GcpAuth,
        organization: Option<&str>,
        project: Option<&str>,
    ) -> GcpResult<Self> {
        let client = auth
            .client(organization, project, &[scopes::GMAIL_READONLY])
            .await?;
        Ok(Self::new(client))
    }

    /// Act on another mailbox (requires domain-wide delegation).
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = user_id.to_string();
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn user_path(&self, suffix: &str) -> String {
        format!("/gmail/v1/users/{}/{}", self.user_id, suffix)
    }

    pub async fn labels(&self) -> GcpResult<Vec<Label>> {
        let list: LabelList = self.client.get(SERVICE, &self.user_path("labels"), &[]).await?;
        Ok(list.labels)
    }

    /// IDs of the messages matching `query`. Load contents with [`Self::message`].
    pub async fn messages(&self, query: &Query) -> GcpResult<Vec<Message>> {
        info!("Loading messages of user \"{}\"", self.user_id);
        let q = query.to_string();
        debug!("Using query: {}", q);

        let mut params: Vec<(&str, String)> = vec![
            ("q", q),
            ("includeSpamTrash", "false".to_string()),
            ("fields", "nextPageToken, messages(id, threadId)".to_string()),
        ];
        params.extend(query.labels.iter().map(|l| ("labelIds", l.id.clone())));

        let refs: Vec<MessageRef> = self
            .client
            .get_all_pages(SERVICE, &self.user_path("messages"), &params, "messages")
            .await?;
        Ok(refs
            .into_iter()
            .map(|r| Message {
                thread_id: r.thread_id,
                ..Message::new(r.id)
            })
            .collect())
    }

    /// Load headers, bodies, labels and attachment references of `message`.
    pub async fn message(&self, message: &Message) -> GcpResult<Message> {
        info!("Loading message \"{}\" of user \"{}\"", message.id, self.user_id);
        let full: FullMessage = self
            .client
            .get(
                SERVICE,
                &self.user_path(&format!("messages/{}", message.id)),
                &[("format", "full"), ("fields", MESSAGE_FIELDS)],
            )
            .await?;

        let timestamp = match full.internal_date.as_deref() {
            Some(ms) => {
                let ms: i64 = ms.parse().map_err(|e| GcpError::parse(SERVICE, e))?;
                Utc.timestamp_millis_opt(ms).single()
            }
            None => None,
        };
        let mut result = Message {
            thread_id: full.thread_id.clone(),
            timestamp,
            labels: full.label_ids.iter().map(Label::new).collect(),
            ..Message::new(full.id.clone())
        };

        for header in &full.payload.headers {
            match header.name.to_ascii_lowercase().as_str() {
                "from" => result.sender = Address::parse_list(&header.value).into_iter().next(),
                "to" => result.to = Address::parse_list(&header.value),
                "cc" => result.cc = Address::parse_list(&header.value),
                "subject" => result.subject = Some(header.value.clone()),
                _ => {}
            }
        }

        for part in &full.payload.parts {
            match part.body.attachment_id {
                Some(ref attachment_id) => result.attachments.push(Attachment {
                    id: attachment_id.clone(),
                    message_id: full.id.clone(),
                    filename: part.filename.clone(),
                    mime_type: part.mime_type.clone(),
                }),
                None => result.add_part(part)?,
            }
        }

        Ok(result)
    }

    /// Download `attachment` into the folder `dst` and return the file path.
    ///
    /// An existing file is an error when `overwrite` is `None` and is kept
    /// (skipping the download) when it is `Some(false)`.
    pub async fn download_attachment(
        &self,
        attachment: &Attachment,
        dst: &Path,
        filename: Option<&str>,
        overwrite: Option<bool>,
    ) -> GcpResult<PathBuf> {
        let dst_path = dst.join(relative_file_name(filename.unwrap_or(&attachment.filename))?);
        let full_path = expand_home(&dst_path);
        if full_path.exists() {
            match overwrite {
                None => {
                    return Err(GcpError::local(
                        SERVICE,
                        "ALREADY_EXISTS",
                        format!("Destination file \"{}\" already exists", dst_path.display()),
                    ))
                }
                Some(false) => {
                    info!("Skipping downloading existing file \"{}\"", dst_path.display());
                    return Ok(dst_path);
                }
                Some(true) => {}
            }
        }

        info!(
            "Downloading attachment of message \"{}\" of user \"{}\" to \"{}\"",
            attachment.message_id,
            self.user_id,
            dst_path.display()
        );
        debug!("Attachment ID: {}", attachment.id);
        let body: AttachmentBody = self
            .client
            .get(
                SERVICE,
                &self.user_path(&format!(
                    "messages/{}/attachments/{}",
                    attachment.message_id, attachment.id
                )),
                &[],
            )
            .await?;

        info!("Saving attachment to \"{}\"", dst_path.display());
        if let Some(folder) = full_path.parent() {
            tokio::fs::create_dir_all(folder)
                .await
                .map_err(|e| GcpError::io(folder, e))?;
        }
        tokio::fs::write(&full_path, decode_base64_url(&body.data)?)
            .await
            .map_err(|e| GcpError::io(&full_path, e))?;
        Ok(dst_path)
    }
}

/// An attachment name as a path that stays below the download folder.
fn relative_file_name(name: &str) -> GcpResult<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => {
                return Err(GcpError::invalid(
                    SERVICE,
                    format!("Invalid attachment file name \"{}\"", name),
                ))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(GcpError::invalid(
            SERVICE,
            format!("Invalid attachment file name \"{}\"", name),
        ));
    }
    Ok(relative)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BASE64_URL;
    use base64::Engine;
    use std::sync::Arc;
    use stormware_gcp::Credentials;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gmail(server: &MockServer) -> Gmail {
        let client = GcpClient::new(Arc::new(Credentials::from_access_token("ya29.test")))
            .with_endpoint(Some(server.uri()))
            .with_retry(0, 1);
        Gmail::new(client)
    }

    fn attachment() -> Attachment {
        Attachment {
            id: "att-1".into(),
            message_id: "m1".into(),
            filename: "invoice.pdf".into(),
            mime_type: Some("application/pdf".into()),
        }
    }

    async fn mount_attachment(server: &MockServer, expected: u64) {
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1/attachments/att-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "size": 8,
                "data": BASE64_URL.encode(b"%PDF-1.7"),
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn lists_labels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "labels": [{"id": "INBOX", "name": "INBOX", "type": "system"}]
            })))
            .mount(&server)
            .await;

        let labels = gmail(&server).labels().await.unwrap();
        assert_eq!(labels, vec![Label { id: "INBOX".into(), name: Some("INBOX".into()) }]);
    }

    #[tokio::test]
    async fn searches_messages_with_label_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/someone@example.com/messages"))
            .and(query_param("q", "from:billing@example.com has:attachment"))
            .and(query_param("labelIds", "INBOX"))
            .and(query_param("includeSpamTrash", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m1", "threadId": "t1"}, {"id": "m2", "threadId": "t2"}]
            })))
            .mount(&server)
            .await;

        let query = Query {
            sender: Some("billing@example.com".into()),
            labels: vec![Label::new("INBOX")],
            attachment: true,
            ..Default::default()
        };
        let messages = gmail(&server)
            .with_user("someone@example.com")
            .messages(&query)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, "m2");
        assert_eq!(messages[1].thread_id.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn loads_full_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1"))
            .and(query_param("format", "full"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "m1",
                "threadId": "t1",
                "labelIds": ["INBOX", "UNREAD"],
                "internalDate": "1704067200123",
                "payload": {
                    "mimeType": "multipart/mixed",
                    "headers": [
                        {"name": "FROM", "value": "Billing <billing@example.com>"},
                        {"name": "To", "value": "a@example.com, B <b@example.com>"},
                        {"name": "Subject", "value": "Your invoice"},
                    ],
                    "parts": [
                        {
                            "mimeType": "multipart/alternative",
                            "parts": [
                                {"mimeType": "text/plain", "body": {"data": BASE64_URL.encode("See attached.")}},
                                {"mimeType": "text/html", "body": {"data": BASE64_URL.encode("<b>See attached.</b>")}},
                            ],
                        },
                        {
                            "mimeType": "application/pdf",
                            "filename": "invoice.pdf",
                            "body": {"attachmentId": "att-1"},
                        },
                    ],
                },
            })))
            .mount(&server)
            .await;

        let message = gmail(&server).message(&Message::new("m1")).await.unwrap();
        let sender = message.sender.as_ref().unwrap();
        assert_eq!(sender.email, "billing@example.com");
        assert_eq!(sender.display_name.as_deref(), Some("Billing"));
        assert_eq!(message.to.len(), 2);
        assert!(message.cc.is_empty());
        assert_eq!(message.subject.as_deref(), Some("Your invoice"));
        assert_eq!(message.plain_text.as_deref(), Some("See attached."));
        assert_eq!(message.html_text.as_deref(), Some("<b>See attached.</b>"));
        assert_eq!(message.timestamp.unwrap().timestamp_millis(), 1_704_067_200_123);
        assert_eq!(message.labels, vec![Label::new("INBOX"), Label::new("UNREAD")]);
        assert_eq!(message.attachments, vec![attachment()]);
    }

    #[tokio::test]
    async fn downloads_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        mount_attachment(&server, 1).await;

        let dst = dir.path().join("mail");
        let saved = gmail(&server)
            .download_attachment(&attachment(), &dst, None, None)
            .await
            .unwrap();
        assert_eq!(saved, dst.join("invoice.pdf"));
        assert_eq!(std::fs::read(&saved).unwrap(), b"%PDF-1.7");
    }

    #[test]
    fn attachment_names_stay_below_destination() {
        assert_eq!(relative_file_name("invoice.pdf").unwrap(), PathBuf::from("invoice.pdf"));
        assert_eq!(relative_file_name("./a/b.txt").unwrap(), PathBuf::from("a/b.txt"));
        for name in ["", ".", "../escaped.txt", "a/../../b", "/etc/passwd"] {
            assert!(relative_file_name(name).is_err(), "{:?} accepted", name);
        }
    }

    #[tokio::test]
    async fn rejects_escaping_attachment_names() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        mount_attachment(&server, 0).await;

        let dst = dir.path().join("downloads");
        let mut escaping = attachment();
        escaping.filename = "../escaped.txt".into();
        let err = gmail(&server)
            .download_attachment(&escaping, &dst, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid attachment file name"));
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[tokio::test]
    async fn nested_attachment_names_create_folders() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        mount_attachment(&server, 1).await;

        let dst = dir.path().join("downloads");
        let saved = gmail(&server)
            .download_attachment(&attachment(), &dst, Some("sub/inner.pdf"), None)
            .await
            .unwrap();
        assert_eq!(saved, dst.join("sub").join("inner.pdf"));
        assert_eq!(std::fs::read(&saved).unwrap(), b"%PDF-1.7");
    }

    #[tokio::test]
    async fn existing_destination_handling() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        mount_attachment(&server, 1).await;
        std::fs::write(dir.path().join("renamed.pdf"), b"old").unwrap();
        let gmail = gmail(&server);

        let err = gmail
            .download_attachment(&attachment(), dir.path(), Some("renamed.pdf"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let kept = gmail
            .download_attachment(&attachment(), dir.path(), Some("renamed.pdf"), Some(false))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&kept).unwrap(), b"old");

        gmail
            .download_attachment(&attachment(), dir.path(), Some("renamed.pdf"), Some(true))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&kept).unwrap(), b"%PDF-1.7");
    }
}
