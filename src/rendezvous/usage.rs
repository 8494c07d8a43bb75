//! Usage-record summarization and blur.
//!
//! The precedence order and the "single-side mood wins" special case for
//! mailboxes follow the reference rendezvous server's `Summary` tests.

use crate::store::Usage;

/// One side's relevant timing/mood fields at teardown time.
#[derive(Debug, Clone, Copy)]
pub struct SideSummary<'a> {
    pub added: f64,
    pub mood: Option<&'a str>,
}

/// Summarize a torn-down (or pruned) nameplate's side rows into a [`Usage`] record.
pub fn summarize_nameplate(rows: &[SideSummary], now: f64, pruned: bool) -> Usage {
    summarize(rows, now, pruned, false)
}

/// Summarize a torn-down (or pruned) mailbox's side rows into a [`Usage`] record.
pub fn summarize_mailbox(rows: &[SideSummary], now: f64, pruned: bool) -> Usage {
    summarize(rows, now, pruned, true)
}

fn summarize(rows: &[SideSummary], now: f64, pruned: bool, is_mailbox: bool) -> Usage {
    let mut addeds: Vec<f64> = rows.iter().map(|r| r.added).collect();
    addeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let started = addeds[0];
    let total_time = now - started;
    let waiting_time = if addeds.len() >= 2 {
        Some(addeds[1] - started)
    } else {
        None
    };

    let result: &'static str = if rows.len() > 2 {
        "crowded"
    } else if pruned {
        "pruney"
    } else if rows.iter().any(|r| r.mood == Some("errory")) {
        "errory"
    } else if rows.iter().any(|r| r.mood == Some("scary")) {
        "scary"
    } else if rows.len() == 1 {
        if is_mailbox {
            // A single-side mailbox's recorded mood wins over the generic
            // "lonely" label, unless it never closed (mood is None) or its
            // mood was already handled above (errory/scary).
            match rows[0].mood {
                Some(mood) => leak(mood),
                None => "lonely",
            }
        } else {
            "lonely"
        }
    } else {
        "happy"
    };

    Usage::new(started, waiting_time, total_time, result)
}

/// `Usage::result` is `&'static str`; the mood strings we might echo back
/// (`"happy"`, `"lonely"`, `"scary"`, `"errory"`) are themselves always
/// `'static`, so this is a lookup, not an actual leak.
fn leak(mood: &str) -> &'static str {
    match mood {
        "happy" => "happy",
        "lonely" => "lonely",
        "scary" => "scary",
        "errory" => "errory",
        _ => "happy",
    }
}

/// Round `started` down to the nearest multiple of `blur_usage` seconds, if configured.
pub fn blur_started(started: f64, blur_usage: Option<f64>) -> f64 {
    match blur_usage {
        Some(window) if window > 0.0 => (started / window).floor() * window,
        _ => started,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(added: f64, mood: Option<&str>) -> SideSummary {
        SideSummary { added, mood }
    }

    #[test]
    fn mailbox_single_side_lonely() {
        let rows = [row(1.0, None)];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, None, 4.0, "lonely"));
    }

    #[test]
    fn mailbox_single_side_mood_wins() {
        let rows = [row(1.0, Some("lonely"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, None, 4.0, "lonely"));

        let rows = [row(1.0, Some("errory"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, None, 4.0, "errory"));
    }

    #[test]
    fn mailbox_single_side_pruned() {
        let rows = [row(1.0, None)];
        assert_eq!(summarize_mailbox(&rows, 5.0, true), Usage::new(1.0, None, 4.0, "pruney"));

        let rows = [row(1.0, Some("happy"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, true), Usage::new(1.0, None, 4.0, "pruney"));
    }

    #[test]
    fn mailbox_two_sides_precedence() {
        let rows = [row(1.0, Some("happy")), row(3.0, Some("happy"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "happy"));

        let rows = [row(1.0, Some("errory")), row(3.0, Some("happy"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "errory"));

        let rows = [row(1.0, Some("happy")), row(3.0, Some("errory"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "errory"));

        let rows = [row(1.0, Some("scary")), row(3.0, Some("happy"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "scary"));

        let rows = [row(1.0, Some("scary")), row(3.0, Some("errory"))];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "scary"));
    }

    #[test]
    fn mailbox_two_sides_pruned_before_close() {
        let rows = [row(1.0, Some("happy")), row(3.0, None)];
        assert_eq!(summarize_mailbox(&rows, 5.0, true), Usage::new(1.0, Some(2.0), 4.0, "pruney"));
    }

    #[test]
    fn mailbox_crowded() {
        let rows = [row(1.0, None), row(3.0, None), row(4.0, None)];
        assert_eq!(summarize_mailbox(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "crowded"));
        assert_eq!(summarize_mailbox(&rows, 5.0, true), Usage::new(1.0, Some(2.0), 4.0, "crowded"));
    }

    #[test]
    fn nameplate_summary() {
        let rows = [row(1.0, None)];
        assert_eq!(summarize_nameplate(&rows, 5.0, false), Usage::new(1.0, None, 4.0, "lonely"));

        let rows = [row(1.0, None), row(3.0, None)];
        assert_eq!(summarize_nameplate(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "happy"));
        assert_eq!(summarize_nameplate(&rows, 5.0, true), Usage::new(1.0, Some(2.0), 4.0, "pruney"));

        let rows = [row(1.0, None), row(3.0, None), row(4.0, None)];
        assert_eq!(summarize_nameplate(&rows, 5.0, false), Usage::new(1.0, Some(2.0), 4.0, "crowded"));
    }

    #[test]
    fn blur_rounds_down() {
        assert_eq!(blur_started(10.0, Some(3600.0)), 0.0);
        assert_eq!(blur_started(10.0, None), 10.0);
        assert_eq!(blur_started(3700.0, Some(3600.0)), 3600.0);
    }
}
