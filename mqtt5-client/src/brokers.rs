use std::time::Duration;

use rand::Rng;

/// The list of broker endpoints the client rotates through.
///
/// Parsed from a string of the form `host[:port](,host[:port])*`. Entries
/// keep their input order; every reconnect attempt moves to the next entry,
/// wrapping around at the end of the list.
#[derive(Debug, Clone)]
pub(crate) struct BrokerList {
    endpoints: Vec<(String, u16)>,
    next: usize,
}

impl BrokerList {
    /// Parse a comma separated host list, applying `default_port` to entries
    /// without an explicit port.
    ///
    /// Whitespace around entries is trimmed, empty entries are skipped and a
    /// malformed port falls back to the default port. Entries containing a
    /// scheme (`://`), e.g. websocket URLs, are kept verbatim.
    pub fn parse(hosts: &str, default_port: u16) -> Self {
        let mut endpoints = Vec::new();
        for entry in hosts.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            if entry.contains("://") {
                endpoints.push((entry.to_owned(), default_port));
                continue;
            }

            match entry.rsplit_once(':') {
                Some((host, port)) => match port.parse::<u16>() {
                    Ok(port) => endpoints.push((host.trim().to_owned(), port)),
                    Err(_) => {
                        log::warn!("Ignoring invalid port '{port}' for broker '{host}'");
                        endpoints.push((host.trim().to_owned(), default_port));
                    }
                },
                None => endpoints.push((entry.to_owned(), default_port)),
            }
        }

        Self { endpoints, next: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// The next endpoint in round-robin order.
    pub fn next(&mut self) -> (String, u16) {
        let endpoint = self.endpoints[self.next].clone();
        self.next = (self.next + 1) % self.endpoints.len();
        endpoint
    }
}

/// Exponential backoff between reconnect sweeps.
///
/// The delay doubles on every failed sweep of the full broker list and is
/// capped. A uniform jitter keeps a fleet of clients from reconnecting in
/// lockstep.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to apply before the next sweep. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);

        let jitter_ceiling = delay.as_nanos() / 4;
        if jitter_ceiling == 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..jitter_ceiling) as u64;
        delay + Duration::from_nanos(jitter)
    }

    /// Reset the schedule after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_are_parsed_in_input_order() {
        let list = BrokerList::parse("broker1:1884, broker2 ,broker3:1885", 1883);
        assert_eq!(
            list.endpoints,
            vec![
                ("broker1".to_owned(), 1884),
                ("broker2".to_owned(), 1883),
                ("broker3".to_owned(), 1885),
            ]
        );
    }

    #[test]
    fn empty_entries_are_skipped() {
        let list = BrokerList::parse(" , broker1,, ", 1883);
        assert_eq!(list.endpoints, vec![("broker1".to_owned(), 1883)]);

        let list = BrokerList::parse("", 1883);
        assert!(list.is_empty());
    }

    #[test]
    fn urls_are_kept_verbatim() {
        let list = BrokerList::parse("ws://broker:8000/mqtt", 1883);
        assert_eq!(
            list.endpoints,
            vec![("ws://broker:8000/mqtt".to_owned(), 1883)]
        );
    }

    #[test]
    fn rotation_wraps_around() {
        let mut list = BrokerList::parse("a,b", 1883);
        assert_eq!(list.next().0, "a");
        assert_eq!(list.next().0, "b");
        assert_eq!(list.next().0, "a");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));

        let mut previous = Duration::ZERO;
        for _ in 0..8 {
            let delay = backoff.next_delay();
            // jitter adds at most 25%
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(75));
            previous = delay.min(Duration::from_secs(60));
        }
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_secs(3));
    }
}
