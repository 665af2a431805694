use url::Url;

/// Strip a filename down to characters that are safe to embed in storage
/// metadata and `Content-Disposition` headers.
#[must_use]
pub fn safe_filename(original: &str) -> String {
    original
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect()
}

/// Append query parameters to a URL, keeping any existing query intact.
pub fn add_query_params<'a, I>(href: &str, params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let Ok(mut url) = Url::parse(href) else {
        return href.to_string();
    };
    {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in params {
            pairs.append_pair(k, v);
        }
    }
    url.into()
}
