//! Stateless rewriting of SIP requests and responses passing through the proxy.
//!
//! Nothing in here touches shared state: every function takes a message (or a
//! piece of one) and returns a rewritten copy or a [`ProxyError`] describing why
//! the message cannot be forwarded.
use crate::error::ProxyError;
use rsip::{
    headers::{ToTypedHeader, UntypedHeader},
    host_with_port::HostWithPort,
    Header, Method, Param, StatusCode, Uri,
};
use rsipstack::transaction::{make_tag, make_via_branch};
use std::net::SocketAddr;

pub const DEFAULT_MAX_FORWARDS: u32 = 70;
pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Splits a header value carrying several comma separated entries
/// (`Via: a, b` or `Record-Route: <x>, <y>`). Commas inside quotes or
/// angle brackets do not split.
pub fn split_header_values(value: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    for c in value.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                let entry = current.trim();
                if !entry.is_empty() {
                    entries.push(entry.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    let entry = current.trim();
    if !entry.is_empty() {
        entries.push(entry.to_string());
    }
    entries
}

/// Extracts the URI of a name-addr (`"Bob" <sip:bob@host>;tag=x`) or a bare
/// addr-spec (`sip:bob@host`).
pub fn parse_name_addr(value: &str) -> Option<Uri> {
    let value = value.trim();
    let addr = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value),
    };
    Uri::try_from(addr.trim()).ok()
}

/// Host and port of `host_with_port`, defaulting to 5060 when the port is absent.
pub fn host_port(host_with_port: &HostWithPort) -> (String, u16) {
    let host = host_with_port
        .host
        .to_string()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = host_with_port
        .port
        .as_ref()
        .map(|p| *p.value())
        .unwrap_or(DEFAULT_SIP_PORT);
    (host, port)
}

pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

pub fn uri_matches(uri: &Uri, host: &str, port: u16) -> bool {
    let (uri_host, uri_port) = host_port(&uri.host_with_port);
    uri_host.eq_ignore_ascii_case(host) && uri_port == port
}

pub fn via_entries(headers: &rsip::Headers) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| match h {
            Header::Via(via) => Some(split_header_values(via.value())),
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn top_via(headers: &rsip::Headers) -> Option<rsip::typed::Via> {
    let entry = via_entries(headers).into_iter().next()?;
    rsip::headers::Via::new(entry).typed().ok()
}

pub fn via_branch(via: &rsip::typed::Via) -> Option<String> {
    via.params.iter().find_map(|param| match param {
        Param::Branch(branch) if !branch.value().is_empty() => Some(branch.value().to_string()),
        _ => None,
    })
}

pub fn top_via_branch(headers: &rsip::Headers) -> Option<String> {
    top_via(headers).as_ref().and_then(via_branch)
}

/// Where a response travelling back along `via` has to be sent, honouring the
/// `received` and `rport` parameters.
pub fn via_response_target(via: &rsip::typed::Via) -> (String, u16) {
    let (mut host, mut port) = host_port(&via.sent_by().host_with_port);
    if let Ok(Some(received)) = via.received() {
        host = received.to_string();
    }
    for param in &via.params {
        if let Param::Other(name, Some(value)) = param {
            if name.value().eq_ignore_ascii_case("rport") {
                if let Ok(parsed) = value.value().parse::<u16>() {
                    port = parsed;
                }
            }
        }
    }
    (host, port)
}

/// `host:port` of the UA that sent a request with these headers, taken from
/// the topmost Via.
pub fn request_source(headers: &rsip::Headers) -> Option<String> {
    let via = top_via(headers)?;
    let (host, port) = via_response_target(&via);
    Some(format_host_port(&host, port))
}

/// Via of this node with a fresh branch.
pub fn make_via(host: &str, port: u16) -> Header {
    Header::Via(rsip::headers::Via::new(format!(
        "SIP/2.0/UDP {}{};rport",
        format_host_port(host, port),
        make_via_branch()
    )))
}

pub fn call_id(headers: &rsip::Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::CallId(call_id) => Some(call_id.value().trim().to_string()),
        _ => None,
    })
}

pub fn from_header(headers: &rsip::Headers) -> Option<&rsip::headers::From> {
    headers.iter().find_map(|h| match h {
        Header::From(from) => Some(from),
        _ => None,
    })
}

pub fn to_header(headers: &rsip::Headers) -> Option<&rsip::headers::To> {
    headers.iter().find_map(|h| match h {
        Header::To(to) => Some(to),
        _ => None,
    })
}

pub fn from_tag(headers: &rsip::Headers) -> Option<String> {
    from_header(headers)?
        .tag()
        .ok()
        .flatten()
        .map(|tag| tag.value().to_string())
}

pub fn to_tag(headers: &rsip::Headers) -> Option<String> {
    to_header(headers)?
        .tag()
        .ok()
        .flatten()
        .map(|tag| tag.value().to_string())
}

pub fn from_user(headers: &rsip::Headers) -> Option<String> {
    let uri = from_header(headers)?.uri().ok()?;
    uri.user()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
}

pub fn to_user(headers: &rsip::Headers) -> Option<String> {
    let uri = to_header(headers)?.uri().ok()?;
    uri.user()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
}

pub fn cseq(headers: &rsip::Headers) -> Option<rsip::typed::CSeq> {
    headers.iter().find_map(|h| match h {
        Header::CSeq(cseq) => cseq.typed().ok(),
        _ => None,
    })
}

pub fn contact_uri(headers: &rsip::Headers) -> Option<Uri> {
    headers.iter().find_map(|h| match h {
        Header::Contact(contact) => parse_name_addr(contact.value()),
        _ => None,
    })
}

/// Registration lifetime requested by a REGISTER: the `Expires` header wins
/// over the Contact `expires` parameter.
pub fn requested_expires(headers: &rsip::Headers) -> Option<u32> {
    let header = headers.iter().find_map(|h| match h {
        Header::Expires(expires) => expires.value().trim().parse::<u32>().ok(),
        _ => None,
    });
    header.or_else(|| {
        headers.iter().find_map(|h| match h {
            Header::Contact(contact) => contact.typed().ok().and_then(|c| {
                c.params.iter().find_map(|p| match p {
                    Param::Expires(expires) => expires.value().parse::<u32>().ok(),
                    _ => None,
                })
            }),
            _ => None,
        })
    })
}

pub fn max_forwards(headers: &rsip::Headers) -> Option<Result<u32, ProxyError>> {
    headers.iter().find_map(|h| match h {
        Header::MaxForwards(mf) => Some(
            mf.value()
                .trim()
                .parse::<u32>()
                .map_err(|_| ProxyError::BadRequest("invalid Max-Forwards".to_string())),
        ),
        _ => None,
    })
}

/// Routes carried by `Route` headers, in header order.
pub fn route_uris(headers: &rsip::Headers) -> Vec<Uri> {
    headers
        .iter()
        .filter_map(|h| match h {
            Header::Route(route) => Some(split_header_values(route.value())),
            _ => None,
        })
        .flatten()
        .filter_map(|entry| parse_name_addr(&entry))
        .collect()
}

/// Inserts Max-Forwards 70 when absent, otherwise decrements it. A request
/// arriving with 0 cannot be forwarded any further.
pub fn decrement_max_forwards(req: &mut rsip::Request) -> Result<u32, ProxyError> {
    let next = match max_forwards(&req.headers) {
        None => DEFAULT_MAX_FORWARDS,
        Some(Ok(0)) => return Err(ProxyError::HopLimitExceeded),
        Some(Ok(n)) => n - 1,
        Some(Err(e)) => return Err(e),
    };
    req.headers
        .retain(|h| !matches!(h, Header::MaxForwards(_)));
    req.headers
        .push(Header::MaxForwards(rsip::headers::MaxForwards::from(next)));
    Ok(next)
}

/// Fails when any Via sent-by already names this node.
pub fn detect_via_loop(req: &rsip::Request, self_hostport: &str) -> Result<(), ProxyError> {
    for entry in via_entries(&req.headers) {
        let via = match rsip::headers::Via::new(entry.clone()).typed() {
            Ok(via) => via,
            Err(_) => continue,
        };
        let (host, port) = host_port(&via.sent_by().host_with_port);
        if format_host_port(&host, port).eq_ignore_ascii_case(self_hostport) {
            return Err(ProxyError::RoutingLoop(entry));
        }
    }
    Ok(())
}

/// Builds the INVITE sent toward `target`.
///
/// Max-Forwards is taken from `original`, which is expected to have been run
/// through [`decrement_max_forwards`] already. This node's Record-Route goes
/// on top of any Record-Route inserted upstream.
pub fn build_outbound_invite(
    original: &rsip::Request,
    target: &Uri,
    self_host: &str,
    self_port: u16,
) -> rsip::Request {
    let mut headers = vec![make_via(self_host, self_port)];
    headers.extend(
        original
            .headers
            .iter()
            .filter(|h| matches!(h, Header::Via(_)))
            .cloned(),
    );
    headers.extend(original.headers.iter().filter_map(|h| match h {
        Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_) | Header::Contact(_) => {
            Some(h.clone())
        }
        _ => None,
    }));

    let max_forwards = match max_forwards(&original.headers) {
        Some(Ok(n)) => n,
        _ => DEFAULT_MAX_FORWARDS,
    };
    headers.push(Header::MaxForwards(rsip::headers::MaxForwards::from(
        max_forwards,
    )));
    headers.push(Header::RecordRoute(rsip::headers::RecordRoute::new(format!(
        "<sip:{};lr>",
        format_host_port(self_host, self_port)
    ))));
    headers.extend(
        original
            .headers
            .iter()
            .filter(|h| matches!(h, Header::RecordRoute(_)))
            .cloned(),
    );

    if !original.body.is_empty() {
        let content_type = original
            .headers
            .iter()
            .find(|h| matches!(h, Header::ContentType(_)))
            .cloned()
            .unwrap_or_else(|| {
                Header::ContentType(rsip::headers::ContentType::new(SDP_CONTENT_TYPE))
            });
        headers.push(content_type);
    }
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(
        original.body.len() as u32,
    )));

    rsip::Request {
        method: Method::Invite,
        uri: target.clone(),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: original.body.clone(),
    }
}

/// Rebuilds a downstream response for delivery upstream: the Via chain comes
/// from the original inbound request, dialog identifiers (including the
/// callee's To tag) come from the downstream response.
pub fn make_upstream_response(
    original: &rsip::Request,
    downstream: &rsip::Response,
) -> rsip::Response {
    let mut headers: Vec<Header> = original
        .headers
        .iter()
        .filter(|h| matches!(h, Header::Via(_)))
        .cloned()
        .collect();

    let mut record_routes = Vec::new();
    let mut contacts = Vec::new();
    let mut content_type = None;
    for h in downstream.headers.iter() {
        match h {
            Header::Via(_) | Header::ContentLength(_) => {}
            Header::RecordRoute(_) => record_routes.push(h.clone()),
            Header::Contact(_) => contacts.push(h.clone()),
            Header::ContentType(_) => content_type = Some(h.clone()),
            _ => headers.push(h.clone()),
        }
    }
    headers.extend(record_routes);
    headers.extend(contacts);

    if !downstream.body.is_empty() {
        headers.push(content_type.unwrap_or_else(|| {
            Header::ContentType(rsip::headers::ContentType::new(SDP_CONTENT_TYPE))
        }));
    }
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(
        downstream.body.len() as u32,
    )));

    rsip::Response {
        status_code: downstream.status_code.clone(),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: downstream.body.clone(),
    }
}

pub fn record_route_uris(headers: &rsip::Headers) -> Vec<Uri> {
    headers
        .iter()
        .filter_map(|h| match h {
            Header::RecordRoute(rr) => Some(split_header_values(rr.value())),
            _ => None,
        })
        .flatten()
        .filter_map(|entry| parse_name_addr(&entry))
        .collect()
}

/// Route sets of both dialog directions as seen from this node, nearest hop
/// first: `(caller to callee, callee to caller)`.
///
/// Record-Route entries above this node's own were inserted downstream, the
/// ones below it upstream. When this node is absent from the list every entry
/// counts for both directions.
pub fn split_route_sets(
    response: &rsip::Response,
    self_host: &str,
    self_port: u16,
) -> (Vec<Uri>, Vec<Uri>) {
    let routes = record_route_uris(&response.headers);
    match routes
        .iter()
        .position(|uri| uri_matches(uri, self_host, self_port))
    {
        Some(index) => {
            let mut toward_callee = routes[..index].to_vec();
            toward_callee.reverse();
            (toward_callee, routes[index + 1..].to_vec())
        }
        None => {
            let mut toward_callee = routes.clone();
            toward_callee.reverse();
            (toward_callee, routes)
        }
    }
}

pub fn strip_self_route<'a>(routes: &'a [Uri], self_host: &str, self_port: u16) -> &'a [Uri] {
    let skip = routes
        .iter()
        .take_while(|uri| uri_matches(uri, self_host, self_port))
        .count();
    &routes[skip..]
}

/// Removes the topmost Via entry, returning it.
pub fn strip_top_via(headers: &mut rsip::Headers) -> Option<String> {
    let mut list: Vec<Header> = headers.iter().cloned().collect();
    let index = list.iter().position(|h| matches!(h, Header::Via(_)))?;
    let mut entries = match &list[index] {
        Header::Via(via) => split_header_values(via.value()),
        _ => return None,
    };
    if entries.is_empty() {
        list.remove(index);
        *headers = list.into();
        return None;
    }
    let removed = entries.remove(0);
    if entries.is_empty() {
        list.remove(index);
    } else {
        list[index] = Header::Via(rsip::headers::Via::new(entries.join(", ")));
    }
    *headers = list.into();
    Some(removed)
}

pub fn prepend_header(headers: &mut rsip::Headers, header: Header) {
    let mut list = vec![header];
    list.extend(headers.iter().cloned());
    *headers = list.into();
}

/// Contact URI built from the address the REGISTER actually came from rather
/// than the one the UA claims, so that UAs behind NAT stay reachable.
pub fn make_reachable_contact(login: &str, source: &str) -> Option<Uri> {
    let addr = source.parse::<SocketAddr>().ok()?;
    Some(Uri {
        scheme: Some(rsip::Scheme::Sip),
        auth: Some(rsip::Auth {
            user: login.to_string(),
            password: None,
        }),
        host_with_port: addr.into(),
        params: vec![Param::Transport(rsip::Transport::Udp)],
        headers: vec![],
    })
}

/// Rewrites an in-dialog request (ACK, BYE) for the next hop. Returns the
/// request and the URI its datagram has to be sent to.
pub fn build_in_dialog_request(
    inbound: &rsip::Request,
    remote_target: &Uri,
    route_set: &[Uri],
    self_host: &str,
    self_port: u16,
) -> Result<(rsip::Request, Uri), ProxyError> {
    let mut req = inbound.clone();
    decrement_max_forwards(&mut req)?;

    let requested = route_uris(&req.headers);
    let remaining = if requested.is_empty() {
        strip_self_route(route_set, self_host, self_port).to_vec()
    } else {
        strip_self_route(&requested, self_host, self_port).to_vec()
    };

    req.headers.retain(|h| !matches!(h, Header::Route(_)));
    for route in remaining.iter() {
        req.headers
            .push(Header::Route(rsip::headers::Route::new(format!("<{}>", route))));
    }
    req.uri = remote_target.clone();
    prepend_header(
        &mut req.headers,
        make_via(self_host, self_port),
    );

    let next_hop = remaining
        .first()
        .cloned()
        .unwrap_or_else(|| remote_target.clone());
    Ok((req, next_hop))
}

/// CANCEL for a pending downstream INVITE: same Request-URI, top Via,
/// From, To, Call-ID and CSeq number.
pub fn build_cancel(invite: &rsip::Request) -> rsip::Request {
    let mut headers = Vec::new();
    if let Some(via) = via_entries(&invite.headers).into_iter().next() {
        headers.push(Header::Via(rsip::headers::Via::new(via)));
    }
    headers.extend(invite.headers.iter().filter_map(|h| match h {
        Header::From(_) | Header::To(_) | Header::CallId(_) | Header::Route(_) => Some(h.clone()),
        _ => None,
    }));
    if let Some(cseq) = cseq(&invite.headers) {
        headers.push(Header::CSeq(rsip::headers::CSeq::new(format!(
            "{} CANCEL",
            cseq.seq
        ))));
    }
    headers.push(Header::MaxForwards(rsip::headers::MaxForwards::from(
        DEFAULT_MAX_FORWARDS,
    )));
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(0u32)));
    rsip::Request {
        method: Method::Cancel,
        uri: invite.uri.clone(),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

/// Response generated by this node for `req`. Everything except a 100 gets a
/// To tag when the request carried none.
pub fn make_response(
    req: &rsip::Request,
    status_code: StatusCode,
    extra_headers: Vec<Header>,
    body: Option<Vec<u8>>,
    server: &str,
) -> rsip::Response {
    let code = status_code.code();
    let mut headers: Vec<Header> = Vec::new();
    for h in req.headers.iter() {
        match h {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                headers.push(h.clone())
            }
            Header::To(to) => {
                let tagged = code > 100 && !matches!(to.tag(), Ok(Some(_)));
                if tagged {
                    headers.push(Header::To(rsip::headers::To::new(format!(
                        "{};tag={}",
                        to.value(),
                        make_tag()
                    ))));
                } else {
                    headers.push(h.clone());
                }
            }
            _ => {}
        }
    }
    let body = body.unwrap_or_default();
    let has_content_type = extra_headers
        .iter()
        .any(|h| matches!(h, Header::ContentType(_)));
    headers.extend(extra_headers);
    if !server.is_empty() {
        headers.push(Header::Server(rsip::headers::Server::new(server)));
    }
    if !body.is_empty() && !has_content_type {
        headers.push(Header::ContentType(rsip::headers::ContentType::new(
            SDP_CONTENT_TYPE,
        )));
    }
    headers.push(Header::ContentLength(rsip::headers::ContentLength::from(
        body.len() as u32,
    )));
    rsip::Response {
        status_code,
        version: rsip::Version::V2,
        headers: headers.into(),
        body,
    }
}
