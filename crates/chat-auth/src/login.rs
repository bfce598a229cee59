//! Login redirect handling
//!
//! Login is an external browser flow: the user opens the provider entry point,
//! and the server redirects back with `?token=<access>` plus a renewal cookie.
//! The client only builds the entry URL and consumes the token from the
//! redirect, stripping it so it is never logged or replayed.

use reqwest::Url;

use crate::constants::{LOGIN_PATH, REDIRECT_TOKEN_PARAM};
use crate::error::Result;
use crate::token::endpoint;

/// URL the user opens to start the identity-provider flow.
pub fn build_login_url(base: &Url) -> Result<Url> {
    endpoint(base, LOGIN_PATH)
}

/// Remove the access token from a redirect URL, returning it.
///
/// Other query parameters are preserved; an empty `token=` counts as absent.
pub fn consume_redirect_token(url: &mut Url) -> Option<String> {
    let mut token = None;
    let rest: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            if k == REDIRECT_TOKEN_PARAM {
                if token.is_none() && !v.is_empty() {
                    token = Some(v.into_owned());
                }
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();

    if rest.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(rest);
    }
    token
}
