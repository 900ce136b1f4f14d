//! 多文件上传：扩展名校验、文件名清洗与写入 consume 目录。

use axum::body::Bytes;
use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use axum_extra::extract::cookie::SignedCookieJar;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::auth::SessionGate;
use crate::error::ApiError;
use crate::flash::{self, Flash};
use crate::storage::{ConsumeDir, StorageError};

pub const FILE_FIELD: &str = "file";

const WINDOWS_DEVICE_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug)]
pub struct UploadConfig {
    pub allowed: AllowedExtensions,
    pub max_request_size: usize,
}

/// Case-insensitive set of accepted extensions, without the leading dot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllowedExtensions(BTreeSet<String>);

impl AllowedExtensions {
    /// Parses a comma separated list such as `pdf, .PNG,jpg`.
    pub fn parse(list: &str) -> Self {
        Self(
            list.split(',')
                .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ext: &str) -> bool {
        self.0.contains(&ext.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// True iff the name has a `.` and its last suffix is in the set.
    pub fn allows(&self, filename: &str) -> bool {
        extension_of(filename).is_some_and(|ext| self.0.contains(&ext))
    }
}

impl fmt::Display for AllowedExtensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.iter().collect::<Vec<_>>().join(", "))
    }
}

/// Lowercased text after the final `.`, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
}

/// 文件名清洗：去掉目录与不安全字符，避免越出目标目录或生成隐藏/保留名。
pub fn sanitize_filename(filename: &str) -> String {
    let spaced: String = filename
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');

    let stem = trimmed.split('.').next().unwrap_or_default();
    if WINDOWS_DEVICE_NAMES
        .iter()
        .any(|device| device.eq_ignore_ascii_case(stem))
    {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}

/// Falls back to a generated name when sanitizing stripped the extension.
fn stored_name(original: &str, ext: &str) -> String {
    let sanitized = sanitize_filename(original);
    if extension_of(&sanitized).as_deref() == Some(ext) {
        sanitized
    } else {
        format!("upload-{}.{ext}", Uuid::new_v4().simple())
    }
}

#[derive(Debug, Clone)]
pub struct SubmittedFile {
    pub filename: String,
    pub content: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    DisallowedExtension,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DisallowedExtension => f.write_str("has an invalid extension"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub filename: String,
    pub reason: RejectReason,
}

/// Per-file outcome of one upload request.
#[derive(Debug, Default)]
pub struct UploadReport {
    pub stored: Vec<String>,
    pub rejected: Vec<Rejection>,
}

impl UploadReport {
    pub fn flashes(&self) -> Vec<Flash> {
        let mut flashes = self
            .rejected
            .iter()
            .map(|rejection| Flash::warning(format!("File {} {}", rejection.filename, rejection.reason)))
            .collect::<Vec<_>>();
        if !self.stored.is_empty() {
            flashes.push(Flash::success(format!(
                "Successfully uploaded {} file(s): {}",
                self.stored.len(),
                self.stored.join(", ")
            )));
        }
        flashes
    }
}

#[derive(Debug)]
pub enum UploadError {
    NoFileSelected,
    Storage(StorageError),
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        UploadError::Storage(err)
    }
}

/// 逐个校验并写入；单个文件被拒不影响其余文件。
pub async fn store_uploads(
    dir: &ConsumeDir,
    allowed: &AllowedExtensions,
    files: Vec<SubmittedFile>,
) -> Result<UploadReport, UploadError> {
    if files.first().is_none_or(|first| first.filename.is_empty()) {
        return Err(UploadError::NoFileSelected);
    }

    let mut report = UploadReport::default();
    for file in files {
        let ext = match extension_of(&file.filename) {
            Some(ext) if allowed.allows(&file.filename) => ext,
            _ => {
                info!(filename = %file.filename, "rejected upload with disallowed extension");
                report.rejected.push(Rejection {
                    filename: file.filename,
                    reason: RejectReason::DisallowedExtension,
                });
                continue;
            }
        };

        let name = stored_name(&file.filename, &ext);
        dir.save(&name, &file.content).await?;
        info!(
            original = %file.filename,
            stored = %name,
            bytes = file.content.len(),
            "stored upload"
        );
        report.stored.push(name);
    }

    Ok(report)
}

/// 上传提交：整体缓冲后再写盘，超限请求不会留下任何文件。
pub async fn upload_files(
    Extension(gate): Extension<Arc<SessionGate>>,
    Extension(consume_dir): Extension<Arc<ConsumeDir>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(SignedCookieJar, Redirect), ApiError> {
    let jar = gate.cookie_jar(&headers);
    let files = match multipart {
        Ok(multipart) => collect_files(multipart).await?,
        Err(rejection) => {
            info!("upload request is not multipart: {}", rejection.body_text());
            None
        }
    };
    let Some(files) = files else {
        let jar = flash::push(jar, [Flash::error("No file part in the request")]);
        return Ok((jar, Redirect::to("/")));
    };

    let report = match store_uploads(&consume_dir, &upload.allowed, files).await {
        Ok(report) => report,
        Err(UploadError::NoFileSelected) => {
            let jar = flash::push(jar, [Flash::error("No file selected")]);
            return Ok((jar, Redirect::to("/")));
        }
        Err(UploadError::Storage(err)) => return Err(err.into()),
    };

    info!(
        stored = report.stored.len(),
        rejected = report.rejected.len(),
        "upload request processed"
    );
    Ok((flash::push(jar, report.flashes()), Redirect::to("/")))
}

/// Returns `None` when the request carried no `file` part at all.
async fn collect_files(mut multipart: Multipart) -> Result<Option<Vec<SubmittedFile>>, ApiError> {
    let mut files = Vec::new();
    let mut saw_file_part = false;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        saw_file_part = true;
        let filename = field.file_name().unwrap_or_default().to_string();
        let content = field.bytes().await.map_err(multipart_error)?;
        files.push(SubmittedFile { filename, content });
    }

    Ok(saw_file_part.then_some(files))
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!("upload request exceeds the size limit");
        ApiError::PayloadTooLarge("upload exceeds the maximum request size".into())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn defaults() -> AllowedExtensions {
        AllowedExtensions::parse("pdf,png,jpg,jpeg,gif,tiff,txt,doc,docx")
    }

    fn file(name: &str, content: &'static [u8]) -> SubmittedFile {
        SubmittedFile {
            filename: name.to_string(),
            content: Bytes::from_static(content),
        }
    }

    #[test]
    fn extension_rule() {
        let allowed = defaults();
        assert!(allowed.allows("report.PDF"));
        assert!(allowed.allows("scan.final.jpeg"));
        assert!(!allowed.allows("noext"));
        assert!(!allowed.allows("trailing."));
        assert!(!allowed.allows("archive.tar.gz"));

        let with_gz = AllowedExtensions::parse("pdf, .GZ");
        assert!(with_gz.allows("archive.tar.gz"));
        assert!(with_gz.contains("gz"));
    }

    #[test]
    fn sanitize_strips_directories_and_unsafe_characters() {
        assert_eq!(sanitize_filename("My Report (final).pdf"), "My_Report_final.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd.txt"), "etc_passwd.txt");
        assert_eq!(sanitize_filename("C:\\Users\\me\\scan.png"), "C_Users_me_scan.png");
        assert_eq!(sanitize_filename(".bashrc.txt"), "bashrc.txt");
        assert_eq!(sanitize_filename("résumé.pdf"), "resume.pdf");
        assert_eq!(sanitize_filename("Ｆｉｌｅ　ｎａｍｅ.txt"), "File_name.txt");
        assert_eq!(sanitize_filename("con.txt"), "_con.txt");
        assert_eq!(sanitize_filename("///"), "");
    }

    #[test]
    fn stored_name_keeps_the_extension() {
        assert_eq!(stored_name("report.PDF", "pdf"), "report.PDF");

        let generated = stored_name("報告.pdf", "pdf");
        assert!(generated.starts_with("upload-"));
        assert!(generated.ends_with(".pdf"));
    }

    #[test]
    fn report_renders_warnings_then_summary() {
        let report = UploadReport {
            stored: vec!["a.pdf".into(), "b.txt".into()],
            rejected: vec![Rejection {
                filename: "evil.exe".into(),
                reason: RejectReason::DisallowedExtension,
            }],
        };
        assert_eq!(
            report.flashes(),
            vec![
                Flash::warning("File evil.exe has an invalid extension"),
                Flash::success("Successfully uploaded 2 file(s): a.pdf, b.txt"),
            ]
        );
    }

    #[tokio::test]
    async fn partial_success_writes_only_valid_files() {
        let temp = tempdir().expect("tempdir");
        let dir = ConsumeDir::new(temp.path().join("consume"));
        let files = vec![
            file("first scan.pdf", b"one"),
            file("payload.exe", b"two"),
            file("notes.TXT", b"three"),
        ];

        let report = store_uploads(&dir, &defaults(), files)
            .await
            .expect("store uploads");

        assert_eq!(report.stored, vec!["first_scan.pdf", "notes.TXT"]);
        assert_eq!(
            report.rejected,
            vec![Rejection {
                filename: "payload.exe".into(),
                reason: RejectReason::DisallowedExtension,
            }]
        );
        let root = dir.root_path();
        assert_eq!(std::fs::read(root.join("first_scan.pdf")).expect("read"), b"one");
        assert_eq!(std::fs::read(root.join("notes.TXT")).expect("read"), b"three");
        assert!(!root.join("payload.exe").exists());
        assert_eq!(std::fs::read_dir(root).expect("read dir").count(), 2);
    }

    #[tokio::test]
    async fn same_name_overwrites_with_latest_content() {
        let temp = tempdir().expect("tempdir");
        let dir = ConsumeDir::new(temp.path().to_path_buf());

        store_uploads(&dir, &defaults(), vec![file("scan.pdf", b"first")])
            .await
            .expect("first upload");
        store_uploads(&dir, &defaults(), vec![file("scan.pdf", b"second")])
            .await
            .expect("second upload");

        let names = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["scan.pdf"]);
        assert_eq!(std::fs::read(temp.path().join("scan.pdf")).expect("read"), b"second");
    }

    #[tokio::test]
    async fn stored_bytes_match_submitted_bytes() {
        let temp = tempdir().expect("tempdir");
        let dir = ConsumeDir::new(temp.path().to_path_buf());
        let content: Vec<u8> = (0..=255u8).cycle().take(64 * 1024 + 7).collect();

        store_uploads(
            &dir,
            &defaults(),
            vec![SubmittedFile {
                filename: "binary.tiff".into(),
                content: Bytes::from(content.clone()),
            }],
        )
        .await
        .expect("store");

        assert_eq!(std::fs::read(temp.path().join("binary.tiff")).expect("read"), content);
    }

    #[tokio::test]
    async fn empty_selection_is_rejected_as_a_whole() {
        let temp = tempdir().expect("tempdir");
        let dir = ConsumeDir::new(temp.path().join("consume"));

        let empty = store_uploads(&dir, &defaults(), Vec::new()).await;
        assert!(matches!(empty, Err(UploadError::NoFileSelected)));

        let blank = store_uploads(&dir, &defaults(), vec![file("", b"")]).await;
        assert!(matches!(blank, Err(UploadError::NoFileSelected)));
        assert!(!dir.root_path().exists());
    }
}
