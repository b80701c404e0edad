use crate::ProxyError;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Methods answered in the `Allow` header of an `OPTIONS` response.
pub const ALLOW_HEADER_VALUE: &str = "GET,HEAD,OPTIONS";

/// Status line plus headers. Every response closes the connection.
pub(crate) async fn write_head<W>(
    w: &mut W,
    status: u16,
    headers: &[(&str, &str)],
    content_length: u64,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut head = format!("HTTP/1.1 {status} {}\r\n", status_text(status));
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {content_length}\r\nConnection: close\r\n\r\n"
    ));
    w.write_all(head.as_bytes()).await?;
    Ok(())
}

pub(crate) async fn write_response<W>(
    w: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_head(w, status, &[("Content-Type", content_type)], body.len() as u64).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

pub(crate) async fn write_error<W>(w: &mut W, status: u16, message: &str) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_response(w, status, "text/plain; charset=utf-8", format!("{message}\n").as_bytes()).await
}

/// `407` with a Basic challenge for `realm`.
pub(crate) async fn write_challenge<W>(w: &mut W, realm: &str) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let challenge = format!("Basic realm=\"{realm}\"");
    write_head(w, 407, &[("Proxy-Authenticate", &challenge)], 0).await?;
    w.flush().await?;
    Ok(())
}

pub(crate) async fn write_options<W>(w: &mut W) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_head(w, 200, &[("Allow", ALLOW_HEADER_VALUE)], 0).await?;
    w.flush().await?;
    Ok(())
}

/// Completes a `CONNECT` handshake. No headers follow; the connection
/// becomes a raw tunnel.
pub(crate) async fn write_established<W>(w: &mut W) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    w.flush().await?;
    Ok(())
}

/// `200` with the content of `file`. `HEAD` requests pass `with_body = false`
/// and get the headers alone.
pub(crate) async fn write_file<W>(
    w: &mut W,
    file: &Path,
    len: u64,
    with_body: bool,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_head(w, 200, &[("Content-Type", content_type_for(file))], len).await?;
    if with_body {
        let mut source = tokio::fs::File::open(file).await?;
        tokio::io::copy(&mut source, w).await?;
    }
    w.flush().await?;
    Ok(())
}

fn content_type_for(file: &Path) -> &'static str {
    match file.extension().and_then(|e| e.to_str()) {
        Some("pom" | "xml") => "application/xml",
        Some("json") => "application/json",
        Some("jar" | "war" | "ear" | "zip") => "application/java-archive",
        Some("tgz" | "gz") => "application/gzip",
        Some("txt" | "md5" | "sha1" | "sha256" | "sha512" | "asc") => "text/plain",
        _ => "application/octet-stream",
    }
}

pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
