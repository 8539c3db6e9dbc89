//! OS signal handling.
//!
//! # Design Decisions
//! - The set of signals is configurable; an empty set never fires
//! - Unix listens for every configured signal; elsewhere only Ctrl-C is
//!   observable and maps to `Interrupt`

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGQUIT
    Quit,
    /// SIGHUP
    Hangup,
}

impl Signal {
    /// Interrupt, terminate and quit.
    pub fn defaults() -> Vec<Signal> {
        vec![Signal::Interrupt, Signal::Terminate, Signal::Quit]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
        }
    }

    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Quit => SignalKind::quit(),
            Signal::Hangup => SignalKind::hangup(),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_start_matches("sig") {
            "int" | "interrupt" => Ok(Signal::Interrupt),
            "term" | "terminate" => Ok(Signal::Terminate),
            "quit" => Ok(Signal::Quit),
            "hup" | "hangup" => Ok(Signal::Hangup),
            other => Err(format!("unknown signal '{other}'")),
        }
    }
}

/// Wait until any of `signals` is delivered and return it.
///
/// Never resolves for an empty set. Errors only if a handler cannot be
/// installed.
#[cfg(unix)]
pub async fn wait_for_any(signals: &[Signal]) -> io::Result<Signal> {
    use futures_util::future::select_all;
    use tokio::signal::unix::signal;

    if signals.is_empty() {
        return std::future::pending().await;
    }

    let mut waiters = Vec::with_capacity(signals.len());
    for &sig in signals {
        let mut stream = signal(sig.kind())?;
        waiters.push(Box::pin(async move {
            stream.recv().await;
            sig
        }));
    }
    let (received, _, _) = select_all(waiters).await;
    Ok(received)
}

#[cfg(not(unix))]
pub async fn wait_for_any(signals: &[Signal]) -> io::Result<Signal> {
    if !signals.contains(&Signal::Interrupt) {
        return std::future::pending().await;
    }
    tokio::signal::ctrl_c().await?;
    Ok(Signal::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_common_spellings() {
        assert_eq!("SIGTERM".parse::<Signal>(), Ok(Signal::Terminate));
        assert_eq!("int".parse::<Signal>(), Ok(Signal::Interrupt));
        assert_eq!("hangup".parse::<Signal>(), Ok(Signal::Hangup));
        assert!("usr1".parse::<Signal>().is_err());
        assert_eq!(Signal::Quit.to_string(), "SIGQUIT");
    }

    #[tokio::test]
    async fn empty_set_never_fires() {
        let res = tokio::time::timeout(Duration::from_millis(20), wait_for_any(&[])).await;
        assert!(res.is_err());
    }
}
