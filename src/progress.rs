use gecko_ingest::Status;
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
};
use std::thread;

const RENDER_FREQUENCY: std::time::Duration = std::time::Duration::from_millis(100);

/// Renders conversion progress to stderr until dropped.
pub struct Progress {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Progress {
    pub fn new(status: Arc<Status>) -> Option<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut renderer = Renderer::new(status)?;
        let thread = thread::spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Relaxed) {
                    if let Err(e) = renderer.render() {
                        log::warn!("failed to render to terminal: {e}");
                    }
                    thread::sleep(RENDER_FREQUENCY);
                }
                if let Err(e) = renderer.clear() {
                    log::warn!("failed to render to terminal: {e}");
                }
            }
        });
        Some(Progress {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.stop.store(true, Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("progress thread panicked");
            }
        }
    }
}

struct Renderer {
    terminal: Box<term::StderrTerminal>,
    status: Arc<Status>,
    last_lines: usize,
}

impl Renderer {
    fn new(status: Arc<Status>) -> Option<Self> {
        Some(Renderer {
            terminal: term::stderr()?,
            status,
            last_lines: 0,
        })
    }

    fn clear(&mut self) -> term::Result<()> {
        for i in 0..std::mem::replace(&mut self.last_lines, 0) {
            if i == 0 {
                self.terminal.carriage_return()?;
            } else {
                self.terminal.cursor_up()?;
            }
            self.terminal.delete_line()?;
        }
        Ok(())
    }

    fn line(&mut self, text: &str) -> term::Result<()> {
        if self.last_lines > 0 {
            writeln!(self.terminal)?;
        }
        write!(self.terminal, "{text}")?;
        self.last_lines += 1;
        Ok(())
    }

    fn render(&mut self) -> term::Result<()> {
        self.clear()?;

        let profiles = &self.status.profiles;
        if !profiles.done() {
            let text = profiles_line(
                profiles.complete_count(),
                profiles.total_count(),
                profiles.converting_count(),
                profiles.failed_count(),
            );
            self.line(&text)?;
        }

        if self.status.is_cancelled() {
            self.line("Cancelling...")?;
        }

        Ok(())
    }
}

fn profiles_line(complete: usize, total: usize, converting: usize, failed: usize) -> String {
    let percent = if total == 0 {
        100.
    } else {
        complete as f64 * 100. / total as f64
    };
    let mut text = format!("Profiles: {percent:.1}% ({complete}/{total}), {converting} converting");
    if failed > 0 {
        text.push_str(&format!(", {failed} failed"));
    }
    text
}
