use crate::config::BasicAuthSection;
use base64::prelude::*;
use warp::{Filter, Rejection};

#[derive(Debug)]
pub(crate) struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

/// Passes every request when auth is disabled, otherwise only matching credentials
pub(crate) fn basic_auth(
    auth: &BasicAuthSection,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    let expected = auth
        .enabled()
        .then(|| format!("{}:{}", auth.username, auth.password));

    warp::header::optional::<String>("authorization")
        .and_then(move |header: Option<String>| {
            let expected = expected.clone();
            async move {
                let presented = credentials(header.as_deref());
                match expected.as_deref() {
                    None => Ok(()),
                    Some(expected) if presented.as_deref() == Some(expected) => Ok(()),
                    Some(_) => Err(warp::reject::custom(Unauthorized)),
                }
            }
        })
        .untuple_one()
}

fn credentials(header: Option<&str>) -> Option<String> {
    let (scheme, encoded) = header?.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(decoded).ok()
}
