//! Prompt input for the terminal loop.

use std::future::Future;
use std::io;

use tokio::io::{AsyncBufRead, Lines};

/// Next input line, or `None` when input ended or `interrupt` fired first.
pub async fn next_input<R>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = io::Result<()>>,
) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        biased;
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn reads_lines_until_input_ends() {
        let mut lines = BufReader::new(&b"hola\nadios\n"[..]).lines();

        let first = next_input(&mut lines, std::future::pending()).await.unwrap();
        assert_eq!(first.as_deref(), Some("hola"));
        let second = next_input(&mut lines, std::future::pending()).await.unwrap();
        assert_eq!(second.as_deref(), Some("adios"));
        assert!(next_input(&mut lines, std::future::pending()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn interrupt_ends_a_waiting_prompt() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();

        let input = next_input(&mut lines, async { Ok(()) }).await.unwrap();
        assert!(input.is_none());
    }
}
