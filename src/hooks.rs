use std::marker::PhantomData;

use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::StatusCode;

use crate::error::HookError;
use crate::exchange::{ProxyRequest, ProxyResponse};

/// A pipeline hook. Returning `Some` short-circuits the pipeline with that
/// response.
pub trait Hook<V>: Send + Sync {
    fn handle(&self, value: &V) -> Result<Option<ProxyResponse>, HookError>;
}

impl<V, F> Hook<V> for F
where
    F: Fn(&V) -> Result<Option<ProxyResponse>, HookError> + Send + Sync,
{
    fn handle(&self, value: &V) -> Result<Option<ProxyResponse>, HookError> {
        self(value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHook;

impl<V> Hook<V> for NoHook {
    fn handle(&self, _value: &V) -> Result<Option<ProxyResponse>, HookError> {
        Ok(None)
    }
}

/// Hooks of one type, run in registration order.
pub struct HookChain<V, H> {
    hooks: Vec<H>,
    _value: PhantomData<fn(&V)>,
}

impl<V, H: Hook<V>> HookChain<V, H> {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            _value: PhantomData,
        }
    }

    pub fn push(&mut self, hook: H) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn run(&self, value: &V) -> Result<Option<ProxyResponse>, HookError> {
        for hook in &self.hooks {
            if let Some(resp) = hook.handle(value)? {
                return Ok(Some(resp));
            }
        }
        Ok(None)
    }
}

impl<V, H: Hook<V>> Default for HookChain<V, H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Answers 403 for requests whose host matches any configured glob.
pub struct HostBlocklist {
    set: GlobSet,
    count: usize,
}

impl HostBlocklist {
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for p in patterns {
            builder.add(Glob::new(&p.to_ascii_lowercase())?);
        }
        Ok(Self {
            set: builder.build()?,
            count: patterns.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.set.is_match(host.to_ascii_lowercase())
    }
}

impl Hook<ProxyRequest> for HostBlocklist {
    fn handle(&self, req: &ProxyRequest) -> Result<Option<ProxyResponse>, HookError> {
        let Some(host) = req.host() else {
            return Ok(None);
        };
        if self.is_blocked(host) {
            crate::logging::info_kv("request blocked", &[("host", host)]);
            return Ok(Some(ProxyResponse::with_body(
                StatusCode::FORBIDDEN,
                "text/plain; charset=utf-8",
                format!("{host} is blocked"),
            )));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn req(url: &str) -> ProxyRequest {
        ProxyRequest::get(Url::parse(url).unwrap())
    }

    #[test]
    fn blocklist_matches_globs_case_insensitively() {
        let bl = HostBlocklist::new(&["*.ads.example".into(), "tracker.test".into()]).unwrap();
        assert_eq!(bl.len(), 2);
        let resp = bl.handle(&req("https://cdn.ADS.example/x.js")).unwrap().unwrap();
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
        assert!(bl.handle(&req("https://tracker.test/")).unwrap().is_some());
        assert!(bl.handle(&req("https://example.com/")).unwrap().is_none());
    }

    #[test]
    fn chain_short_circuits_on_first_response() {
        type F = fn(&ProxyRequest) -> Result<Option<ProxyResponse>, HookError>;
        let mut chain: HookChain<ProxyRequest, F> = HookChain::new();
        chain.push(|_| Ok(None));
        chain.push(|_| Ok(Some(ProxyResponse::new(StatusCode::IM_A_TEAPOT))));
        chain.push(|_| Err(HookError::new("never", "runs")));
        let out = chain.run(&req("https://example.com/")).unwrap().unwrap();
        assert_eq!(out.status, StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn chain_propagates_hook_errors() {
        type F = fn(&ProxyRequest) -> Result<Option<ProxyResponse>, HookError>;
        let mut chain: HookChain<ProxyRequest, F> = HookChain::new();
        chain.push(|_| Err(HookError::new("audit", "disk full")));
        let err = chain.run(&req("https://example.com/")).unwrap_err();
        assert_eq!(err.hook, "audit");
    }
}
