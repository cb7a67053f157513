//! Console icons with plain-text fallbacks for terminals without emoji.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");

pub static REPO: Emoji<'_, '_> = Emoji("📚 ", "");
pub static IMAGE: Emoji<'_, '_> = Emoji("🐳 ", "");
pub static COMMIT: Emoji<'_, '_> = Emoji("🔖 ", "-");
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
pub static KEY: Emoji<'_, '_> = Emoji("🔑 ", "");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", ">");
