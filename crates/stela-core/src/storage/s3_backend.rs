use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rusty_s3::actions::{CreateMultipartUpload, ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::storage::{
    ListPage, MultipartConfig, ObjectMeta, ObjectStore, RetryPolicy, StoreError, StoreResult,
};

/// Validity window for presigned request URLs.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// S3-compatible object store over presigned requests.
pub struct S3Store {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryPolicy,
    multipart: MultipartConfig,
    /// Root path prepended to all keys.
    root: String,
}

impl S3Store {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        retry: RetryPolicy,
        multipart: MultipartConfig,
    ) -> StoreResult<Self> {
        let base_url = endpoint.parse().map_err(|e| {
            StoreError::Permanent(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;
        // Endpoint is always explicit in the store URL; use path-style addressing.
        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| StoreError::Permanent(format!("failed to create S3 bucket handle: {e}")))?;
        let credentials = Credentials::new(access_key_id, secret_access_key);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();
        Ok(Self {
            bucket,
            credentials,
            agent,
            retry,
            multipart,
            root: root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn classify(op: &str, key: &str, err: ureq::Error) -> StoreError {
        match err {
            ureq::Error::Status(404, _) => StoreError::NotFound(key.to_string()),
            ureq::Error::Status(code, _) if code == 429 || code >= 500 => {
                StoreError::Transient(format!("S3 {op} {key}: status {code}"))
            }
            ureq::Error::Status(code, _) => {
                StoreError::Permanent(format!("S3 {op} {key}: status {code}"))
            }
            ureq::Error::Transport(t) => StoreError::Transient(format!("S3 {op} {key}: {t}")),
        }
    }

    fn call(
        &self,
        op: &str,
        key: &str,
        f: impl Fn() -> std::result::Result<ureq::Response, ureq::Error>,
    ) -> StoreResult<ureq::Response> {
        self.retry
            .run(op, StoreError::is_transient, || {
                f().map_err(|e| Self::classify(op, key, e))
            })
    }

    fn single_put(&self, key: &str, data: &[u8]) -> StoreResult<String> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);
        let resp = self.call("PUT", key, || self.agent.put(url.as_str()).send_bytes(data))?;
        Ok(resp.header("ETag").unwrap_or_default().to_string())
    }

    fn multipart_put(
        &self,
        key: &str,
        reader: &mut dyn Read,
        size_hint: u64,
    ) -> StoreResult<String> {
        let full_key = self.full_key(key);
        let part_size = self.multipart.part_size(size_hint) as usize;

        let url = self
            .bucket
            .create_multipart_upload(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);
        let resp = self.call("CREATE_MULTIPART", key, || {
            self.agent.post(url.as_str()).call()
        })?;
        let body = resp
            .into_string()
            .map_err(|e| StoreError::Permanent(format!("S3 CREATE_MULTIPART {key}: {e}")))?;
        let upload = CreateMultipartUpload::parse_response(&body).map_err(|e| {
            StoreError::Permanent(format!("S3 CREATE_MULTIPART {key}: bad response: {e}"))
        })?;
        let upload_id = upload.upload_id();

        match self.upload_parts(key, &full_key, upload_id, reader, part_size) {
            Ok(etags) => {
                let action = self.bucket.complete_multipart_upload(
                    Some(&self.credentials),
                    &full_key,
                    upload_id,
                    etags.iter().map(String::as_str),
                );
                let complete_url = action.sign(PRESIGN_DURATION);
                let complete_body = action.body();
                self.call("COMPLETE_MULTIPART", key, || {
                    self.agent
                        .post(complete_url.as_str())
                        .send_string(&complete_body)
                })?;
                // The final ETag names the whole assembled object.
                Ok(format!("multipart-{}", etags.len()))
            }
            Err(e) => {
                let abort_url = self
                    .bucket
                    .abort_multipart_upload(Some(&self.credentials), &full_key, upload_id)
                    .sign(PRESIGN_DURATION);
                if let Err(abort_err) = self.agent.delete(abort_url.as_str()).call() {
                    tracing::warn!(key, "failed to abort multipart upload: {abort_err}");
                }
                Err(e)
            }
        }
    }

    /// Upload parts in waves of `part_concurrency`. The reader is consumed
    /// sequentially, so in-flight memory stays at
    /// `part_concurrency × part_size`. Any part failure cancels the
    /// remaining siblings in its wave.
    fn upload_parts(
        &self,
        key: &str,
        full_key: &str,
        upload_id: &str,
        reader: &mut dyn Read,
        part_size: usize,
    ) -> StoreResult<Vec<String>> {
        let mut etags: Vec<String> = Vec::new();
        let mut part_number: u16 = 0;
        let concurrency = self.multipart.part_concurrency.max(1);

        loop {
            // Fill the next wave.
            let mut wave: Vec<(u16, Vec<u8>)> = Vec::with_capacity(concurrency);
            for _ in 0..concurrency {
                let chunk = read_chunk(reader, part_size)
                    .map_err(|e| StoreError::Permanent(format!("read for PUT {key}: {e}")))?;
                if chunk.is_empty() {
                    break;
                }
                part_number += 1;
                wave.push((part_number, chunk));
            }
            if wave.is_empty() {
                break;
            }

            let cancelled = AtomicBool::new(false);
            let results: Mutex<Vec<(u16, StoreResult<String>)>> = Mutex::new(Vec::new());
            std::thread::scope(|s| {
                for (number, data) in &wave {
                    let cancelled = &cancelled;
                    let results = &results;
                    s.spawn(move || {
                        if cancelled.load(Ordering::Acquire) {
                            return;
                        }
                        let out = self.upload_one_part(key, full_key, upload_id, *number, data);
                        if out.is_err() {
                            cancelled.store(true, Ordering::Release);
                        }
                        results.lock().unwrap().push((*number, out));
                    });
                }
            });

            let mut outcomes = results.into_inner().unwrap();
            outcomes.sort_by_key(|(n, _)| *n);
            for (_, out) in outcomes {
                etags.push(out?);
            }
        }

        Ok(etags)
    }

    fn upload_one_part(
        &self,
        key: &str,
        full_key: &str,
        upload_id: &str,
        part_number: u16,
        data: &[u8],
    ) -> StoreResult<String> {
        let url = self
            .bucket
            .upload_part(Some(&self.credentials), full_key, part_number, upload_id)
            .sign(PRESIGN_DURATION);
        let resp = self.call(&format!("UPLOAD_PART {part_number}"), key, || {
            self.agent.put(url.as_str()).send_bytes(data)
        })?;
        resp.header("ETag")
            .map(str::to_string)
            .ok_or_else(|| {
                StoreError::Permanent(format!(
                    "S3 UPLOAD_PART {key} part {part_number}: response missing ETag"
                ))
            })
    }
}

/// Read up to `limit` bytes, returning a short buffer only at EOF.
fn read_chunk(reader: &mut dyn Read, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

impl ObjectStore for S3Store {
    fn put(&self, key: &str, reader: &mut dyn Read, size_hint: u64) -> StoreResult<String> {
        if size_hint > self.multipart.threshold {
            return self.multipart_put(key, reader, size_hint);
        }
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| StoreError::Permanent(format!("read for PUT {key}: {e}")))?;
        self.single_put(key, &data)
    }

    fn get_from(&self, key: &str, offset: u64) -> StoreResult<Box<dyn Read + Send>> {
        let full_key = self.full_key(key);
        let mut action = self.bucket.get_object(Some(&self.credentials), &full_key);
        let range = format!("bytes={offset}-");
        if offset > 0 {
            action.headers_mut().insert("Range", &range);
        }
        let url = action.sign(PRESIGN_DURATION);
        let resp = self.call("GET", key, || {
            let mut req = self.agent.get(url.as_str());
            if offset > 0 {
                req = req.set("Range", &range);
            }
            req.call()
        })?;
        Ok(Box::new(resp.into_reader()))
    }

    fn list_page(&self, prefix: &str, start_after: Option<&str>) -> StoreResult<ListPage> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
        action.query_mut().insert("prefix", &full_prefix);
        let full_after = start_after.map(|k| self.full_key(k));
        if let Some(ref after) = full_after {
            action.query_mut().insert("start-after", after);
        }
        let url = action.sign(PRESIGN_DURATION);

        let resp = self.call("LIST", prefix, || self.agent.get(url.as_str()).call())?;
        let mut body = Vec::new();
        resp.into_reader()
            .read_to_end(&mut body)
            .map_err(|e| StoreError::Permanent(format!("S3 LIST {prefix}: {e}")))?;
        let body_str = String::from_utf8(body)
            .map_err(|e| StoreError::Permanent(format!("S3 LIST {prefix}: invalid utf8: {e}")))?;
        let parsed = ListObjectsV2::parse_response(&body_str).map_err(|e| {
            StoreError::Permanent(format!("S3 LIST {prefix}: failed to parse response: {e}"))
        })?;

        let objects = parsed
            .contents
            .iter()
            .filter(|obj| !obj.key.ends_with('/'))
            .map(|obj| {
                let key = if root_prefix_len > 0 && obj.key.len() > root_prefix_len {
                    obj.key[root_prefix_len..].to_string()
                } else {
                    obj.key.clone()
                };
                ObjectMeta {
                    key,
                    size: obj.size,
                    mod_time: chrono::DateTime::parse_from_rfc3339(&obj.last_modified)
                        .ok()
                        .map(|t| t.with_timezone(&chrono::Utc)),
                }
            })
            .collect();

        Ok(ListPage {
            objects,
            truncated: parsed.next_continuation_token.is_some(),
        })
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);
        match self.call("DELETE", key, || self.agent.delete(url.as_str()).call()) {
            Ok(_) => Ok(()),
            // Deleting a missing object is a success: delete is idempotent.
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);
        match self.call("HEAD", key, || self.agent.head(url.as_str()).call()) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
