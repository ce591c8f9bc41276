// Provider backed by a fixed list of mirror URLs, handed out in random order.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::traits::MirrorProvider;

pub struct FixedProvider {
    mirrors: Vec<String>,
}

impl FixedProvider {
    pub fn new(mirrors: Vec<String>) -> Self {
        Self { mirrors }
    }
}

#[async_trait]
impl MirrorProvider for FixedProvider {
    async fn next_mirror(&self) -> Result<String> {
        let Some(url) = self.mirrors.choose(&mut rand::thread_rng()) else {
            bail!("no mirrors configured");
        };
        Ok(url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_from_the_list() {
        let provider = FixedProvider::new(vec!["https://a/".into(), "https://b/".into()]);
        for _ in 0..10 {
            let mirror = provider.next_mirror().await.unwrap();
            assert!(mirror == "https://a/" || mirror == "https://b/");
        }
    }

    #[tokio::test]
    async fn empty_list_is_an_error() {
        let provider = FixedProvider::new(Vec::new());
        assert!(provider.next_mirror().await.is_err());
    }
}
