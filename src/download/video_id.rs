use url::Url;

/// Pulls the file identifier out of a share link, or returns the input as-is.
///
/// Recognizes `/file/d/<ID>/...` paths and `?id=<ID>` queries. Anything else
/// is passed through for the metadata lookup to reject.
pub fn extract_video_id(input: &str) -> String {
    let input = input.trim();

    if !input.contains('/') && !input.contains('.') {
        return input.to_string();
    }

    let Ok(url) = Url::parse(input) else {
        return input.to_string();
    };

    if let Some(segments) = url.path_segments() {
        let segments = segments.collect::<Vec<_>>();
        let found = segments
            .windows(3)
            .find(|window| window[0] == "file" && window[1] == "d" && is_id(window[2]))
            .map(|window| window[2].to_string());
        if let Some(id) = found {
            return id;
        }
    }

    url.query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| input.to_string())
}

fn is_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
