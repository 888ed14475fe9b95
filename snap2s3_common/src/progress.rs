// snap2s3_common is the main snap2s3 library implementing the migration core.
// Copyright (C) 2025  snap2s3 contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncRead, ReadBuf};

/// Returns a progress bar tracking raw bytes, used while uploading.
pub fn byte_bar(total: u64, msg: String) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} ({bytes_per_sec})",
        )
        .expect("valid progress template"),
    );
    bar.set_message(msg);
    bar
}

/// Returns a progress bar tracking KiB units, used while validating.
/// Two counters feed it at once, so the total is the sum of both sides.
pub fn unit_bar(total: u64, msg: String) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{elapsed_precise}] {wide_bar} {pos}/{len} KiB")
            .expect("valid progress template"),
    );
    bar.set_message(msg);
    bar
}

/// A `UnitCounter` feeds a [`ProgressBar`] in units of `unit` bytes,
/// carrying the remainder between calls so no bytes are dropped.
pub struct UnitCounter {
    bar: ProgressBar,
    unit: u64,
    carry: u64,
}

impl UnitCounter {
    pub fn new(bar: ProgressBar, unit: u64) -> Self {
        Self {
            bar,
            unit: unit.max(1),
            carry: 0,
        }
    }

    /// Accounts for `n` more bytes.
    pub fn add(&mut self, n: u64) {
        self.carry += n;
        let ticks = self.carry / self.unit;
        if ticks > 0 {
            self.bar.inc(ticks);
            self.carry %= self.unit;
        }
    }
}

/// A `CountingReader` passes reads through to its inner reader while
/// feeding a progress bar. With `raise_total` set, the bar's total is
/// raised whenever the position passes it, so the displayed percentage
/// never exceeds 100% even when the pre-upload size estimate was low.
pub struct CountingReader<R> {
    inner: R,
    counter: UnitCounter,
    raise_total: bool,
}

impl<R> CountingReader<R> {
    /// Counts raw bytes and raises the bar total past the estimate.
    pub fn raising(inner: R, bar: ProgressBar) -> Self {
        Self {
            inner,
            counter: UnitCounter::new(bar, 1),
            raise_total: true,
        }
    }

    /// Counts in units of `unit` bytes against a fixed total.
    pub fn with_unit(inner: R, bar: ProgressBar, unit: u64) -> Self {
        Self {
            inner,
            counter: UnitCounter::new(bar, unit),
            raise_total: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let me = &mut *self;

        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                me.counter.add(n);

                if me.raise_total {
                    let bar = &me.counter.bar;
                    match bar.length() {
                        Some(len) if bar.position() > len => bar.set_length(bar.position()),
                        _ => {}
                    }
                }

                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_counter_carries_remainders() {
        let bar = ProgressBar::hidden();
        bar.set_length(10);

        let mut counter = UnitCounter::new(bar.clone(), 1024);
        counter.add(1000);
        assert_eq!(bar.position(), 0);
        counter.add(1000);
        assert_eq!(bar.position(), 1);
        counter.add(1024 * 5);
        assert_eq!(bar.position(), 6);
    }

    #[tokio::test]
    async fn raising_reader_lifts_the_total() {
        use tokio::io::AsyncReadExt;

        let bar = ProgressBar::hidden();
        bar.set_length(4);

        let mut reader = CountingReader::raising(&b"0123456789"[..], bar.clone());
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        assert_eq!(bar.position(), 10);
        assert_eq!(bar.length(), Some(10));
    }
}
