// ===============================
// src/levels.rs
// ===============================
//
// Stack of unpaired hedge fills. The front entry is the last unpaired
// trade; every entry shares one side. A fill on the opposite side pairs
// against the front, realizes PnL and shrinks the stack. The stack is
// mirrored to disk after every mutation so a restart resumes where the
// previous session left off.
//
// Files under the aux folder:
//   levels  - one "<price>;<side>;<volume>" line per entry, bottom of
//             stack (oldest) first
//   pnl     - cumulative realized PnL, single line
//   pnl_log - append-only trace of every pairing

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::domain::{double_equals, Bbo, Side};
use crate::metrics::{LEVELS_DEPTH, PNL_REALIZED};

const LEVELS_FILE: &str = "levels";
const PNL_FILE: &str = "pnl";
const PNL_LOG_FILE: &str = "pnl_log";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub volume: f64,
    pub price: f64,
    pub side: Side,
}

#[derive(Debug)]
pub struct Levels {
    aux_folder: PathBuf,
    levels: VecDeque<Level>,
    price_sweetener: f64,
}

impl Levels {
    /// Opens the book, restoring any stack persisted by a previous run.
    pub fn open(aux_folder: impl Into<PathBuf>, price_sweetener: f64) -> Self {
        let mut book = Self {
            aux_folder: aux_folder.into(),
            levels: VecDeque::new(),
            price_sweetener,
        };
        book.load();
        LEVELS_DEPTH.set(book.levels.len() as i64);
        book
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn front(&self) -> Option<&Level> {
        self.levels.front()
    }

    /// Folds a fresh fill into the stack.
    ///
    /// Same side as the front: push. Opposite side: pair against the front,
    /// realize PnL, and spill into deeper entries when the fill is larger
    /// than the front. The front volume is reduced by the incoming volume,
    /// not the paired volume (see DESIGN.md, Open Questions).
    pub fn update_levels(&mut self, traded_volume: f64, traded_price: f64, side: Side, contract_multiplier: f64) {
        let front = self.levels.front().copied();
        match front {
            None => {
                self.levels.push_front(Level { volume: traded_volume, price: traded_price, side });
            }
            Some(front) if front.side == side => {
                self.levels.push_front(Level { volume: traded_volume, price: traded_price, side });
            }
            Some(front) => {
                let paired_volume = front.volume.min(traded_volume);
                self.store_pnl(front.price, traded_price, side, paired_volume, contract_multiplier);

                let remainder = front.volume - traded_volume;
                if double_equals(remainder, 0.0) {
                    self.levels.pop_front();
                } else if remainder < 0.0 {
                    // The fill consumed this level entirely; spill the rest
                    // into the next one.
                    self.levels.pop_front();
                    self.update_levels(traded_volume - front.volume, traded_price, side, contract_multiplier);
                    return;
                } else if let Some(entry) = self.levels.front_mut() {
                    // The fill did not cover the whole level.
                    entry.volume = traded_volume;
                }
            }
        }

        self.store();
        LEVELS_DEPTH.set(self.levels.len() as i64);
        debug!(depth = self.levels.len(), "levels updated");
    }

    /// Price for the next hedge order. Far touch when the stack is empty;
    /// otherwise never worse than the front level adjusted by the sweetener.
    pub fn price_to_use(&self, side: Side, bbo: &Bbo, contract_multiplier: f64) -> Option<f64> {
        let front = match self.levels.front() {
            None => {
                return match side {
                    Side::Buy => bbo.bid,
                    Side::Sell => bbo.ask,
                }
            }
            Some(front) => front,
        };

        let margin = contract_multiplier * self.price_sweetener;
        match side {
            Side::Buy => {
                let reference = front.price - margin;
                bbo.bid.map(|bid| bid.min(reference))
            }
            Side::Sell => {
                let reference = front.price + margin;
                bbo.ask.map(|ask| ask.max(reference))
            }
        }
    }

    /// Volume for the next hedge order: the full correction when joining the
    /// front side, otherwise no more than the front can absorb.
    pub fn volume_to_use(&self, side: Side, corrections_todo: f64) -> f64 {
        match self.levels.front() {
            None => corrections_todo,
            Some(front) if front.side == side => corrections_todo,
            Some(front) => corrections_todo.min(front.volume),
        }
    }

    fn store_pnl(
        &mut self,
        front_price: f64,
        report_price: f64,
        report_side: Side,
        raw_paired_volume: f64,
        contract_multiplier: f64,
    ) {
        let paired_volume = raw_paired_volume * contract_multiplier;

        let mut top_value = paired_volume / front_price;
        if report_side == Side::Buy {
            top_value = -top_value;
        }

        let mut report_value = paired_volume / report_price;
        if report_side == Side::Sell {
            report_value = -report_value;
        }

        let calculated_pnl = top_value + report_value;

        let pnl_path = self.aux_folder.join(PNL_FILE);
        let previous = read_pnl(&pnl_path).unwrap_or(0.0);
        let total = previous + calculated_pnl;

        if let Err(e) = fs::write(&pnl_path, format!("{total}\n")) {
            error!(?e, path = %pnl_path.display(), "failed to store pnl");
        }
        PNL_REALIZED.set(total);

        let log_path = self.aux_folder.join(PNL_LOG_FILE);
        let trace = format!(
            "Formula:\n\
             top_value = {paired_volume} / {front_price} = {top_value}\n\
             report_value = {paired_volume} / {report_price} = {report_value}\n\
             report side : {report_side}\n\
             {top_value} + {report_value} = {calculated_pnl}\n"
        );
        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .and_then(|mut file| file.write_all(trace.as_bytes()))
        {
            error!(?e, path = %log_path.display(), "failed to append pnl log");
        }

        debug!(pnl = calculated_pnl, total, "realized pnl");
    }

    fn store(&self) {
        let path = self.aux_folder.join(LEVELS_FILE);
        let mut contents = String::new();
        // Bottom of the stack first; the front (most recent fill) is the
        // last line.
        for level in self.levels.iter().rev() {
            contents.push_str(&format!("{};{};{}\n", level.price, level.side.level_code(), level.volume));
        }

        // Write-then-rename keeps the file whole even if we die mid-write.
        let tmp_path = self.aux_folder.join(format!("{LEVELS_FILE}.tmp"));
        let result = fs::write(&tmp_path, contents).and_then(|_| fs::rename(&tmp_path, &path));
        if let Err(e) = result {
            error!(?e, path = %path.display(), "failed to store levels");
        }
    }

    fn load(&mut self) {
        let path = self.aux_folder.join(LEVELS_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return, // first run, nothing stored yet
        };

        // Lines are bottom-to-top, so pushing each onto the front leaves
        // the last line as the front again.
        for line in contents.lines() {
            match parse_level(line) {
                Some(level) => self.levels.push_front(level),
                None => warn!(%line, "skipping malformed levels line"),
            }
        }
    }

    /// Cumulative realized PnL as persisted on disk.
    pub fn realized_pnl(&self) -> f64 {
        read_pnl(&self.aux_folder.join(PNL_FILE)).unwrap_or(0.0)
    }
}

fn read_pnl(path: &Path) -> Option<f64> {
    let contents = fs::read_to_string(path).ok()?;
    contents.lines().next()?.trim().parse().ok()
}

fn parse_level(line: &str) -> Option<Level> {
    let mut fields = line.split(';');
    let price: f64 = fields.next()?.trim().parse().ok()?;
    let side = Side::from_level_code(fields.next()?.trim().parse().ok()?)?;
    let volume: f64 = fields.next()?.trim().parse().ok()?;
    Some(Level { volume, price, side })
}
