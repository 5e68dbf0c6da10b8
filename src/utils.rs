use std::path::{Path, PathBuf};

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ' ',
        "_",
    )
}

/// Build "<uploader> - <title>.<ext>" with unsafe characters replaced.
pub fn build_track_filename(uploader: &str, title: &str, extension: &str) -> String {
    sanitize_filename(&format!("{} - {}.{}", uploader, title, extension))
}

pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    let mut path = dir.join(filename);
    let mut counter = 1;

    while path.exists() {
        let file_stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        let new_filename = if extension.is_empty() {
            format!("{}_{}", file_stem, counter)
        } else {
            format!("{}_{}.{}", file_stem, counter, extension)
        };

        path = dir.join(new_filename);
        counter += 1;
    }
    path
}

/// Map a MIME essence to the audio file extension it implies.
pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    match essence {
        "audio/mp4" => "m4a",
        "audio/x-wav" | "audio/wav" => "wav",
        _ => "mp3",
    }
}

/// Infer a file extension from the final URL path, falling back to
/// content-type sniffing when the path has no recognized audio extension.
pub fn infer_extension(final_url: &str, content_type: Option<&str>) -> String {
    if let Ok(url) = url::Url::parse(final_url) {
        if let Some(ext) = Path::new(url.path()).extension().and_then(|e| e.to_str()) {
            let ext = ext.to_ascii_lowercase();
            if matches!(ext.as_str(), "mp3" | "m4a" | "mp4" | "wav") {
                return if ext == "mp4" { "m4a".to_string() } else { ext };
            }
        }
    }
    content_type
        .map(extension_for_content_type)
        .unwrap_or("mp3")
        .to_string()
}
