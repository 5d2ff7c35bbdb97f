//! IMAP protocol operations: connection, folder state, fetch, and flag management.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;

use crate::constants::{FLAG_FETCH_BATCH_SIZE, FOLDER_REOPEN_BATCHES};
use crate::mail::parser::{parse_flags_from_imap, parse_message};
use crate::mail::types::{
    AttachmentMeta, FetchedMessage, FlagChange, MessageFlags, RemoteFolderState,
};
use crate::mail::MailSource;

use super::{GatewaySession, ImapGateway};

/// FETCH profile for full message ingest.
const FETCH_PROFILE: &str = "(UID FLAGS RFC822.SIZE BODY.PEEK[])";

/// FETCH profile for flag reconciliation, no body transfer.
const FLAGS_PROFILE: &str = "(UID FLAGS)";

impl ImapGateway {
    //
    // Connection Management
    //

    pub async fn connect(&mut self) -> Result<()> {
        use async_native_tls::TlsConnector;
        use tokio::net::TcpStream;
        use tokio_util::compat::TokioAsyncReadCompatExt;

        let addr = format!("{}:{}", self.config.host, self.config.port);

        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;

        // Wrap tokio stream with compat layer for futures-io compatibility
        let tcp_compat = tcp.compat();

        let mut tls = TlsConnector::new();
        if self.config.insecure {
            tls = tls
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        // The certificate is validated against ssl_trust when configured,
        // otherwise against the connection host.
        let domain = self.config.ssl_trust.as_deref().unwrap_or(&self.config.host);

        let tls_stream = tls
            .connect(domain, tcp_compat)
            .await
            .context("TLS handshake failed")?;

        let client = async_imap::Client::new(tls_stream);

        let session = client
            .login(&self.config.user, &self.config.pass)
            .await
            .map_err(|e| anyhow::anyhow!("Login failed: {:?}", e.0))?;

        self.session = Some(session);
        self.open_folder = None;
        self.batches_since_select = 0;
        tracing::info!("Connected to IMAP server {}", self.config.host);

        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.open_folder = None;
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
        Ok(())
    }

    pub(crate) fn session(&mut self) -> Result<&mut GatewaySession> {
        self.session
            .as_mut()
            .context("Not connected to IMAP server")
    }

    /// Select `folder` read-write unless it is already the open folder.
    async fn ensure_selected(&mut self, folder: &str) -> Result<()> {
        if self.open_folder.as_deref() == Some(folder) {
            return Ok(());
        }
        self.session()?
            .select(folder)
            .await
            .with_context(|| format!("Failed to select folder '{}'", folder))?;
        self.open_folder = Some(folder.to_string());
        self.batches_since_select = 0;
        Ok(())
    }

    /// Re-select the open folder, dropping the client library's cached
    /// message content for it.
    async fn reselect(&mut self, folder: &str) -> Result<()> {
        self.session()?
            .select(folder)
            .await
            .with_context(|| format!("Failed to re-select folder '{}'", folder))?;
        self.open_folder = Some(folder.to_string());
        self.batches_since_select = 0;
        tracing::debug!("Re-selected '{}' to release cached content", folder);
        Ok(())
    }

    //
    // Folder Operations
    //

    pub async fn folder_names(&mut self) -> Result<Vec<String>> {
        let session = self.session()?;

        let mut folders = Vec::new();
        let mut list_stream = session.list(Some(""), Some("*")).await?;

        while let Some(result) = list_stream.next().await {
            if let Ok(name) = result {
                folders.push(name.name().to_string());
            }
        }
        drop(list_stream);

        folders.sort();
        Ok(folders)
    }

    /// Open the folder read-only, read its state triple, and close it again.
    pub async fn read_folder_state(&mut self, folder: &str) -> Result<RemoteFolderState> {
        let session = self.session()?;
        let mailbox = session
            .examine(folder)
            .await
            .with_context(|| format!("Failed to examine folder '{}'", folder))?;

        let state = RemoteFolderState {
            uidvalidity: mailbox.uid_validity.unwrap_or(0),
            uidnext: mailbox.uid_next.unwrap_or(0),
            message_count: mailbox.exists,
        };

        session.close().await.ok();
        self.open_folder = None;
        Ok(state)
    }

    /// All UIDs of the folder in a single round trip.
    pub async fn read_folder_uids(&mut self, folder: &str) -> Result<BTreeSet<u32>> {
        self.ensure_selected(folder).await?;
        let uids = self
            .session()?
            .uid_search("ALL")
            .await
            .with_context(|| format!("UID SEARCH failed in '{}'", folder))?;
        Ok(uids.into_iter().collect())
    }

    //
    // Fetch Operations
    //

    /// Fetch one window of messages by UID, parsing each and spilling raw
    /// bytes and attachments to disk when `data_path` is given.
    pub async fn fetch_message_batch(
        &mut self,
        folder: &str,
        uids: &[u32],
        data_path: Option<&Path>,
    ) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_selected(folder).await?;
        if self.batches_since_select >= FOLDER_REOPEN_BATCHES {
            self.reselect(folder).await?;
        }
        self.batches_since_select += 1;

        let uid_set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        // Collect the raw responses first; parsing and disk writes happen
        // after the stream is drained so the session borrow ends early.
        let mut raw_batch: Vec<(u32, MessageFlags, Option<Vec<u8>>, Option<u32>)> = Vec::new();
        {
            let session = self.session()?;
            let mut messages = session
                .uid_fetch(&uid_set, FETCH_PROFILE)
                .await
                .context("Failed to fetch messages")?;

            while let Some(result) = messages.next().await {
                let fetch = result.context("Failed to fetch message")?;
                let Some(uid) = fetch.uid else { continue };
                let flag_vec: Vec<_> = fetch.flags().collect();
                let flags = parse_flags_from_imap(&flag_vec);
                raw_batch.push((uid, flags, fetch.body().map(|b| b.to_vec()), fetch.size));
            }
        }

        let mut fetched = Vec::with_capacity(raw_batch.len());
        for (uid, flags, body, size) in raw_batch {
            let Some(raw) = body else {
                fetched.push(FetchedMessage::Failed {
                    uid,
                    error: "server returned no message body".to_string(),
                });
                continue;
            };

            let eml_path = match data_path {
                Some(root) => match write_eml(root, folder, uid, &raw).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        fetched.push(FetchedMessage::Failed {
                            uid,
                            error: format!("failed to write eml: {e}"),
                        });
                        continue;
                    }
                },
                None => None,
            };

            let size = size.unwrap_or(raw.len() as u32);
            match parse_message(uid, &raw, flags, size) {
                Ok((mut parsed, payloads)) => {
                    parsed.eml_path = eml_path;
                    if let Some(root) = data_path {
                        if let Err(e) =
                            write_attachments(root, folder, uid, &mut parsed.attachments, &payloads)
                                .await
                        {
                            // Extraction failures drop the attachment list;
                            // the message itself is still stored.
                            tracing::debug!("attachment extraction failed for uid {}: {}", uid, e);
                            parsed.attachments.clear();
                        }
                    }
                    fetched.push(FetchedMessage::Parsed(Box::new(parsed)));
                }
                Err(e) => {
                    tracing::warn!("Failed to parse uid {} in '{}': {}", uid, folder, e);
                    fetched.push(FetchedMessage::Failed {
                        uid,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            "Fetched {} of {} requested messages from '{}'",
            fetched.len(),
            uids.len(),
            folder
        );
        Ok(fetched)
    }

    /// Flag-only fetch for the given UIDs.
    pub async fn read_flags(
        &mut self,
        folder: &str,
        uids: &[u32],
    ) -> Result<HashMap<u32, MessageFlags>> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }

        self.ensure_selected(folder).await?;

        let mut flag_map = HashMap::with_capacity(uids.len());
        for chunk in uids.chunks(FLAG_FETCH_BATCH_SIZE) {
            let uid_set = chunk
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");

            let session = self.session()?;
            let mut messages = session
                .uid_fetch(&uid_set, FLAGS_PROFILE)
                .await
                .context("Failed to fetch flags")?;

            while let Some(result) = messages.next().await {
                let fetch = result.context("Failed to fetch flags")?;
                if let Some(uid) = fetch.uid {
                    let flag_vec: Vec<_> = fetch.flags().collect();
                    flag_map.insert(uid, parse_flags_from_imap(&flag_vec));
                }
            }
        }

        Ok(flag_map)
    }

    //
    // Flag Mutation and Expunge
    //

    /// Apply `+FLAGS` / `-FLAGS` stores for each change, read-write.
    pub async fn set_flags(&mut self, folder: &str, changes: &[FlagChange]) -> Result<()> {
        self.ensure_selected(folder).await?;

        for change in changes {
            if !change.add.is_empty() {
                let names = change.add.imap_names().join(" ");
                self.store_flags(change.uid, &format!("+FLAGS ({})", names))
                    .await?;
            }
            if !change.remove.is_empty() {
                let names = change.remove.imap_names().join(" ");
                self.store_flags(change.uid, &format!("-FLAGS ({})", names))
                    .await?;
            }
        }

        Ok(())
    }

    async fn store_flags(&mut self, uid: u32, query: &str) -> Result<()> {
        let session = self.session()?;
        let responses: Vec<_> = session
            .uid_store(uid.to_string(), query)
            .await
            .context("Failed to store flags")?
            .collect()
            .await;

        for response in responses {
            if let Err(e) = response {
                tracing::warn!("Error in flag store response: {:?}", e);
            }
        }
        Ok(())
    }

    pub async fn expunge(&mut self, folder: &str) -> Result<()> {
        self.ensure_selected(folder).await?;

        let session = self.session()?;
        let responses: Vec<_> = session
            .expunge()
            .await
            .context("Failed to expunge")?
            .collect()
            .await;

        for response in responses {
            if let Err(e) = response {
                tracing::warn!("Error in expunge response: {:?}", e);
            }
        }
        Ok(())
    }
}

impl MailSource for ImapGateway {
    async fn list_folders(&mut self) -> Result<Vec<String>> {
        self.folder_names().await
    }

    async fn folder_state(&mut self, folder: &str) -> Result<RemoteFolderState> {
        self.read_folder_state(folder).await
    }

    async fn folder_uids(&mut self, folder: &str) -> Result<BTreeSet<u32>> {
        self.read_folder_uids(folder).await
    }

    async fn fetch_batch(
        &mut self,
        folder: &str,
        uids: &[u32],
        data_path: Option<&Path>,
    ) -> Result<Vec<FetchedMessage>> {
        self.fetch_message_batch(folder, uids, data_path).await
    }

    async fn fetch_flags(
        &mut self,
        folder: &str,
        uids: &[u32],
    ) -> Result<HashMap<u32, MessageFlags>> {
        self.read_flags(folder, uids).await
    }
}

/// Write raw RFC822 bytes to `<root>/eml/<folder>/<uid>.eml`, returning the
/// relative path.
async fn write_eml(root: &Path, folder: &str, uid: u32, raw: &[u8]) -> Result<String> {
    let dir = root.join("eml").join(folder);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let file = dir.join(format!("{}.eml", uid));
    tokio::fs::write(&file, raw)
        .await
        .with_context(|| format!("Failed to write {}", file.display()))?;
    Ok(format!("eml/{}/{}.eml", folder, uid))
}

/// Write attachment payloads to `<root>/attachments/<folder>/<uid>/` and
/// record each file's relative path on its metadata entry.
async fn write_attachments(
    root: &Path,
    folder: &str,
    uid: u32,
    attachments: &mut [AttachmentMeta],
    payloads: &[Vec<u8>],
) -> Result<()> {
    if attachments.is_empty() {
        return Ok(());
    }

    let dir = root.join("attachments").join(folder).join(uid.to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    for (i, meta) in attachments.iter_mut().enumerate() {
        let Some(payload) = payloads.get(i) else { break };
        let filename = sanitize_filename(&meta.filename, i);
        let file = dir.join(&filename);
        tokio::fs::write(&file, payload)
            .await
            .with_context(|| format!("Failed to write {}", file.display()))?;
        meta.path = Some(format!("attachments/{}/{}/{}", folder, uid, filename));
    }

    Ok(())
}

/// Strip path separators and hidden-file prefixes from an attachment name.
fn sanitize_filename(name: &str, index: usize) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        format!("part-{}", index)
    } else {
        cleaned.to_string()
    }
}
