//! Destination naming for uploaded files.
//!
//! Files land in a folder chosen by their kind (`images/`, `videos/`, ...)
//! under a collision-resistant name: `<millis>-<random>-<stem>.<ext>`.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Broad content class of a file, used to pick its folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Code,
    Other,
}

impl FileKind {
    /// Classifies a file by MIME type, falling back to its extension.
    ///
    /// Exact MIME matches win, then the extension, then loose MIME
    /// substring matches.
    pub fn classify(mime_type: &str, file_name: &str) -> Self {
        let mime = mime_type.to_ascii_lowercase();
        if let Some(kind) = Self::from_exact_mime(&mime) {
            return kind;
        }

        if let Some(kind) = extension(file_name).and_then(|e| Self::from_extension(&e)) {
            return kind;
        }

        if mime.is_empty() {
            return Self::Other;
        }
        if mime.starts_with("image/") {
            return Self::Image;
        }
        if mime.starts_with("video/") {
            return Self::Video;
        }
        if mime.starts_with("audio/") {
            return Self::Audio;
        }
        const DOCUMENT_HINTS: &[&str] = &[
            "pdf",
            "word",
            "document",
            "excel",
            "spreadsheet",
            "powerpoint",
            "presentation",
        ];
        if DOCUMENT_HINTS.iter().any(|h| mime.contains(h)) {
            return Self::Document;
        }
        if mime.contains("text") {
            return Self::Code;
        }
        const ARCHIVE_HINTS: &[&str] = &[
            "zip", "rar", "7z", "tar", "gzip", "compress", "package", "installer",
        ];
        if ARCHIVE_HINTS.iter().any(|h| mime.contains(h)) {
            return Self::Archive;
        }
        if ["javascript", "json", "xml"].iter().any(|h| mime.contains(h)) {
            return Self::Code;
        }
        Self::Other
    }

    /// Folder name files of this kind are stored under.
    pub fn folder(self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
            Self::Audio => "audio",
            Self::Document => "documents",
            Self::Archive => "archives",
            Self::Code => "code",
            Self::Other => "files",
        }
    }

    fn from_exact_mime(mime: &str) -> Option<Self> {
        let kind = match mime {
            "image/jpeg" | "image/jpg" | "image/png" | "image/gif" | "image/webp"
            | "image/svg+xml" | "image/bmp" | "image/tiff" | "image/x-icon" | "image/heic"
            | "image/heif" => Self::Image,
            "video/mp4" | "video/webm" | "video/ogg" | "video/mpeg" | "video/quicktime"
            | "video/x-msvideo" | "video/x-flv" | "video/x-matroska" | "video/3gpp"
            | "video/3gpp2" => Self::Video,
            "audio/mpeg" | "audio/mp3" | "audio/wav" | "audio/ogg" | "audio/aac"
            | "audio/webm" | "audio/flac" | "audio/x-m4a" | "audio/midi" | "audio/x-ms-wma" => {
                Self::Audio
            }
            "application/pdf"
            | "application/msword"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            | "application/vnd.ms-excel"
            | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-powerpoint"
            | "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            | "application/vnd.oasis.opendocument.text"
            | "application/vnd.oasis.opendocument.spreadsheet"
            | "application/vnd.oasis.opendocument.presentation"
            | "text/plain"
            | "text/csv"
            | "text/markdown"
            | "application/rtf" => Self::Document,
            "application/zip"
            | "application/x-zip-compressed"
            | "application/x-rar-compressed"
            | "application/x-rar"
            | "application/vnd.rar"
            | "application/x-7z-compressed"
            | "application/gzip"
            | "application/x-gzip"
            | "application/x-tar"
            | "application/x-bzip"
            | "application/x-bzip2"
            | "application/vnd.android.package-archive"
            | "application/x-msdownload"
            | "application/x-msi"
            | "application/x-apple-diskimage"
            | "application/x-debian-package"
            | "application/x-rpm"
            | "application/octet-stream" => Self::Archive,
            "text/html" | "text/css" | "text/javascript" | "application/javascript"
            | "application/json" | "application/xml" | "text/xml" | "text/x-python"
            | "text/x-c" | "text/x-c++" | "application/x-sh" | "text/x-shellscript" => Self::Code,
            _ => return None,
        };
        Some(kind)
    }

    fn from_extension(ext: &str) -> Option<Self> {
        let kind = match ext {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "svg" | "bmp" | "ico" | "heic" | "heif" => {
                Self::Image
            }
            "mp4" | "webm" | "avi" | "mov" | "mkv" | "flv" | "wmv" | "3gp" => Self::Video,
            "mp3" | "wav" | "ogg" | "aac" | "flac" | "m4a" | "wma" => Self::Audio,
            "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "md" | "csv"
            | "rtf" => Self::Document,
            "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" | "apk" | "exe" | "msi" | "dmg"
            | "deb" | "rpm" | "pkg" => Self::Archive,
            "html" | "css" | "js" | "jsx" | "ts" | "tsx" | "json" | "xml" | "py" | "java"
            | "c" | "cpp" | "cs" | "php" | "sh" | "bash" | "rs" => Self::Code,
            _ => return None,
        };
        Some(kind)
    }
}

/// Lowercased extension of `file_name`, if it has one.
fn extension(file_name: &str) -> Option<String> {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < file_name.len() => {
            Some(file_name[dot + 1..].to_ascii_lowercase())
        }
        _ => None,
    }
}

const MAX_STEM_CHARS: usize = 50;
const RANDOM_SUFFIX_LEN: usize = 6;

/// Generates a unique stored name for `original_name`.
pub fn generate_file_name(original_name: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format_file_name(original_name, millis, &random)
}

fn format_file_name(original_name: &str, millis: i64, random: &str) -> String {
    let base = original_name.rsplit(['/', '\\']).next().unwrap_or(original_name);
    let (stem, ext) = match base.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < base.len() => (&base[..dot], Some(&base[dot + 1..])),
        _ => (base, None),
    };

    let clean: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || is_cjk(c) {
                c
            } else {
                '-'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();
    let clean = if clean.is_empty() { "file".to_string() } else { clean };

    match ext {
        Some(ext) => {
            let ext: String = ext.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            format!("{millis}-{random}-{clean}.{ext}")
        }
        None => format!("{millis}-{random}-{clean}"),
    }
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

/// Full destination path `<folder>/<unique name>` for a new upload.
pub fn destination_path(original_name: &str, mime_type: &str) -> String {
    let folder = FileKind::classify(mime_type, original_name).folder();
    format!("{folder}/{}", generate_file_name(original_name))
}
