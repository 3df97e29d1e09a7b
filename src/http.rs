//! HTTP処理
//!
//! httparseによるリクエスト/レスポンスヘッダーの解析、chunkedボディの
//! デコード、キャッシュ情報ヘッダー（X-Cache等）を付与したレスポンスの
//! 組み立てを提供します。

use crate::cache::object::CacheObject;
use crate::cache::state::CacheStatus;

/// ヘッダー部の最大サイズ
pub const MAX_HEADER_SIZE: usize = 16 * 1024;
/// ヘッダー数の上限
pub const MAX_HEADERS: usize = 64;

// ====================
// 静的エラーレスポンス
// ====================

pub static ERR_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub static ERR_FORBIDDEN: &[u8] =
    b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub static ERR_LENGTH_REQUIRED: &[u8] =
    b"HTTP/1.1 411 Length Required\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub static ERR_HEADER_TOO_LARGE: &[u8] =
    b"HTTP/1.1 431 Request Header Fields Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub static ERR_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
pub static ERR_GATEWAY_TIMEOUT: &[u8] =
    b"HTTP/1.1 504 Gateway Timeout\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// 503メンテナンスページ
///
/// キャッシュにもフォールバックできない場合の最終手段
pub static MAINTENANCE_BODY: &[u8] = b"<!DOCTYPE html>\n<html><head><title>Service Unavailable</title></head>\n<body><h1>503 Service Unavailable</h1>\n<p>The site is temporarily unavailable. Please try again shortly.</p>\n</body></html>\n";

/// 503レスポンスを組み立てる
pub fn maintenance_response(keep_alive: bool) -> Vec<u8> {
    serialize_response(
        503,
        &[(
            b"content-type".to_vec().into(),
            b"text/html; charset=utf-8".to_vec().into(),
        )],
        MAINTENANCE_BODY,
        &[("X-Cache", "PASS"), ("Retry-After", "30")],
        true,
        keep_alive,
    )
}

// ====================
// リクエスト解析
// ====================

/// 解析済みリクエスト
#[derive(Debug)]
pub struct ParsedRequest {
    /// HTTPメソッド
    pub method: Vec<u8>,
    /// リクエストターゲット（パス+クエリ）
    pub target: String,
    /// パス部分（クエリなし）
    pub path: String,
    /// ヘッダー（名前は小文字化しない。照合はeq_ignore_ascii_case）
    pub headers: Vec<(Box<[u8]>, Box<[u8]>)>,
    /// ヘッダー部のバイト長（ボディの開始位置）
    pub header_len: usize,
    /// keep-aliveするか
    pub keep_alive: bool,
}

/// リクエスト解析の結果
pub enum ParseOutcome {
    /// 解析完了
    Complete(ParsedRequest),
    /// データ不足。続きを読む
    Partial,
    /// 不正なリクエスト
    Invalid,
}

/// リクエストヘッダーを解析
pub fn parse_request(buf: &[u8]) -> ParseOutcome {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let header_len = match request.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ParseOutcome::Partial,
        Err(_) => return ParseOutcome::Invalid,
    };

    let (method, target, version) = match (request.method, request.path, request.version) {
        (Some(m), Some(p), Some(v)) => (m, p, v),
        _ => return ParseOutcome::Invalid,
    };

    let parsed_headers: Vec<(Box<[u8]>, Box<[u8]>)> = request
        .headers
        .iter()
        .map(|h| (h.name.as_bytes().to_vec().into(), h.value.to_vec().into()))
        .collect();

    // HTTP/1.1はデフォルトkeep-alive、1.0はConnection: keep-aliveのときだけ
    let connection = find_header(&parsed_headers, b"connection");
    let keep_alive = match connection {
        Some(v) if v.eq_ignore_ascii_case(b"close") => false,
        Some(v) if v.eq_ignore_ascii_case(b"keep-alive") => true,
        _ => version == 1,
    };

    let path = match target.find('?') {
        Some(idx) => target[..idx].to_string(),
        None => target.to_string(),
    };

    ParseOutcome::Complete(ParsedRequest {
        method: method.as_bytes().to_vec(),
        target: target.to_string(),
        path,
        headers: parsed_headers,
        header_len,
        keep_alive,
    })
}

impl ParsedRequest {
    /// ヘッダー値を取得
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }

    /// Hostヘッダー値
    pub fn host(&self) -> Option<&str> {
        self.header(b"host").and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Content-Length（なければNone）
    pub fn content_length(&self) -> Option<usize> {
        self.header(b"content-length")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.trim().parse().ok())
    }

    /// Transfer-Encoding: chunked かどうか
    pub fn is_chunked(&self) -> bool {
        self.header(b"transfer-encoding")
            .map(is_chunked_encoding)
            .unwrap_or(false)
    }
}

/// ヘッダーリストから値を検索
pub fn find_header<'a>(headers: &'a [(Box<[u8]>, Box<[u8]>)], name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_ref())
}

/// Transfer-Encoding ヘッダー値から chunked かどうかを判定
///
/// カンマ区切りの最後の要素がchunkedであることを確認する
pub fn is_chunked_encoding(value: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .next_back()
        .map(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
        .unwrap_or(false)
}

// ====================
// レスポンス解析
// ====================

/// 解析済みレスポンスヘッダー
#[derive(Debug)]
pub struct ParsedResponseHead {
    /// ステータスコード
    pub status_code: u16,
    /// ヘッダー
    pub headers: Vec<(Box<[u8]>, Box<[u8]>)>,
    /// ヘッダー部のバイト長
    pub header_len: usize,
    /// Content-Length（なければNone）
    pub content_length: Option<usize>,
    /// Transfer-Encoding: chunked かどうか
    pub is_chunked: bool,
}

/// レスポンス解析の結果
pub enum ResponseParseOutcome {
    Complete(ParsedResponseHead),
    Partial,
    Invalid,
}

/// レスポンスヘッダーを解析
pub fn parse_response_head(buf: &[u8]) -> ResponseParseOutcome {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let header_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return ResponseParseOutcome::Partial,
        Err(_) => return ResponseParseOutcome::Invalid,
    };

    let status_code = match response.code {
        Some(c) => c,
        None => return ResponseParseOutcome::Invalid,
    };

    let parsed_headers: Vec<(Box<[u8]>, Box<[u8]>)> = response
        .headers
        .iter()
        .map(|h| (h.name.as_bytes().to_vec().into(), h.value.to_vec().into()))
        .collect();

    let content_length = find_header(&parsed_headers, b"content-length")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.trim().parse().ok());

    let is_chunked = find_header(&parsed_headers, b"transfer-encoding")
        .map(is_chunked_encoding)
        .unwrap_or(false);

    ResponseParseOutcome::Complete(ParsedResponseHead {
        status_code,
        headers: parsed_headers,
        header_len,
        content_length,
        is_chunked,
    })
}

// ====================
// chunkedデコード
// ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// チャンクサイズ行を待っている
    Size,
    /// チャンクデータ本体（残りバイト数）
    Data(usize),
    /// チャンクデータ直後のCRLF
    DataEnd,
    /// 0チャンク後のトレーラー部
    Trailer,
    /// 完了
    Done,
}

/// chunkedボディの逐次デコーダ
///
/// オリジンから読んだバイト列を順に与えると、デコード済みボディを
/// 内部に蓄積する
pub struct ChunkedDecoder {
    state: ChunkState,
    /// 行をまたぐデータの持ち越し
    pending: Vec<u8>,
    body: Vec<u8>,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            pending: Vec::new(),
            body: Vec::new(),
        }
    }

    /// デコードが完了したか
    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// デコード済みボディを取り出す
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// デコード済みボディの現在長
    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// 受信データを与える
    ///
    /// 完了したらOk(true)。不正なチャンクエンコーディングはErr
    pub fn push(&mut self, data: &[u8]) -> Result<bool, ()> {
        self.pending.extend_from_slice(data);

        loop {
            match self.state {
                ChunkState::Size => {
                    let line_end = match find_crlf(&self.pending) {
                        Some(idx) => idx,
                        None => break,
                    };
                    let size = parse_chunk_size(&self.pending[..line_end])?;
                    self.pending.drain(..line_end + 2);
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if self.pending.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.pending.len());
                    self.body.extend_from_slice(&self.pending[..take]);
                    self.pending.drain(..take);
                    if take == remaining {
                        self.state = ChunkState::DataEnd;
                    } else {
                        self.state = ChunkState::Data(remaining - take);
                        break;
                    }
                }
                ChunkState::DataEnd => {
                    if self.pending.len() < 2 {
                        break;
                    }
                    if &self.pending[..2] != b"\r\n" {
                        return Err(());
                    }
                    self.pending.drain(..2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let line_end = match find_crlf(&self.pending) {
                        Some(idx) => idx,
                        None => break,
                    };
                    let is_blank = line_end == 0;
                    self.pending.drain(..line_end + 2);
                    if is_blank {
                        self.state = ChunkState::Done;
                    }
                    // 空行でなければトレーラー行として読み捨てて続行
                }
                ChunkState::Done => break,
            }
        }

        Ok(self.is_done())
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// チャンクサイズ行をパース（chunk拡張は無視）
fn parse_chunk_size(line: &[u8]) -> Result<usize, ()> {
    let hex_part = line.split(|&b| b == b';').next().ok_or(())?;
    let s = std::str::from_utf8(hex_part).map_err(|_| ())?;
    usize::from_str_radix(s.trim(), 16).map_err(|_| ())
}

// ====================
// レスポンス組み立て
// ====================

/// これらのヘッダーは中継しない（hop-by-hop）
fn is_hop_by_hop(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"connection")
        || name.eq_ignore_ascii_case(b"keep-alive")
        || name.eq_ignore_ascii_case(b"transfer-encoding")
        || name.eq_ignore_ascii_case(b"te")
        || name.eq_ignore_ascii_case(b"upgrade")
        || name.eq_ignore_ascii_case(b"proxy-connection")
        || name.eq_ignore_ascii_case(b"proxy-authenticate")
        || name.eq_ignore_ascii_case(b"proxy-authorization")
        || name.eq_ignore_ascii_case(b"trailer")
        || name.eq_ignore_ascii_case(b"content-length")
}

/// 一般的なステータスの理由句
fn status_reason(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// レスポンスバイト列を組み立てる
///
/// hop-by-hopヘッダーを除いた`headers`に`extra`を足し、Content-Lengthと
/// Connectionを付け直す。HEADの場合は`include_body=false`でボディを省く
pub fn serialize_response(
    status_code: u16,
    headers: &[(Box<[u8]>, Box<[u8]>)],
    body: &[u8],
    extra: &[(&str, &str)],
    include_body: bool,
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + headers.len() * 48 + if include_body { body.len() } else { 0 });
    let mut itoa_buf = itoa::Buffer::new();

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(itoa_buf.format(status_code).as_bytes());
    out.push(b' ');
    out.extend_from_slice(status_reason(status_code).as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        out.extend_from_slice(name);
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }

    for (name, value) in extra {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"Content-Length: ");
    out.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    out.extend_from_slice(b"\r\n");

    if keep_alive {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        out.extend_from_slice(b"Connection: close\r\n");
    }

    out.extend_from_slice(b"\r\n");

    if include_body {
        out.extend_from_slice(body);
    }

    out
}

/// キャッシュオブジェクトからレスポンスを組み立てる
///
/// X-Cache / X-Cache-Hits / Age / X-Backend を付与する
pub fn build_cached_response(
    object: &CacheObject,
    status: CacheStatus,
    hits: u64,
    now: u64,
    include_body: bool,
    keep_alive: bool,
) -> Vec<u8> {
    let mut hits_buf = itoa::Buffer::new();
    let mut age_buf = itoa::Buffer::new();
    let hits_str = hits_buf.format(hits);
    let age_str = age_buf.format(object.age_secs(now));

    serialize_response(
        object.status_code,
        &object.headers,
        &object.body,
        &[
            ("X-Cache", status.as_str()),
            ("X-Cache-Hits", hits_str),
            ("Age", age_str),
            ("X-Backend", &object.backend_id),
        ],
        include_body,
        keep_alive,
    )
}
