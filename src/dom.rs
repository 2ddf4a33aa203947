use anyhow::{Context, Result};
use headless_chrome::Tab;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

use crate::browser::{Challenge, ChallengeKind};

/// JavaScript that looks for a known challenge marker and reports it as JSON.
///
/// Reports one of:
///   - a site-key widget (reCAPTCHA / hCaptcha iframe or `[data-sitekey]` holder),
///   - an image challenge (an `<img>` whose src/alt/id mentions captcha), tagging
///     the image and its answer input with data attributes so they can be located again.
///
/// Returns an empty string when the page is clean.
const PROBE_CHALLENGE_JS: &str = r#"
(() => {
  const holder = document.querySelector('[data-sitekey]');
  const frame = document.querySelector('iframe[src*="recaptcha"], iframe[src*="hcaptcha"]');
  if (frame || holder) {
    const src = frame ? frame.src : '';
    const hcaptcha = src.includes('hcaptcha') || (holder && holder.classList.contains('h-captcha'));
    return JSON.stringify({
      provider: hcaptcha ? 'hcaptcha' : 'recaptcha',
      frame_src: src,
      site_key: holder ? holder.getAttribute('data-sitekey') : null,
    });
  }
  const img = document.querySelector('img[src*="captcha" i], img[alt*="captcha" i], img[id*="captcha" i]');
  if (img) {
    img.setAttribute('data-harvest-challenge', 'image');
    const input = document.querySelector('input[name*="captcha" i], input[id*="captcha" i]');
    if (input) input.setAttribute('data-harvest-challenge', 'answer');
    return JSON.stringify({
      provider: 'image',
      image_selector: '[data-harvest-challenge="image"]',
      answer_selector: input ? '[data-harvest-challenge="answer"]' : null,
    });
  }
  return '';
})()
"#;

static SITE_KEY_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&#](?:k|sitekey)=([^&#]+)").expect("static regex"));

#[derive(Debug, Deserialize)]
struct ProbeReport {
    provider: String,
    #[serde(default)]
    frame_src: Option<String>,
    #[serde(default)]
    site_key: Option<String>,
    #[serde(default)]
    image_selector: Option<String>,
    #[serde(default)]
    answer_selector: Option<String>,
}

/// Turn the raw probe output into a `Challenge`.
pub fn parse_probe(raw: &str) -> Result<Option<Challenge>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let report: ProbeReport =
        serde_json::from_str(raw).with_context(|| format!("bad challenge probe output: {raw}"))?;

    let kind = match report.provider.as_str() {
        "recaptcha" => ChallengeKind::RecaptchaV2,
        "hcaptcha" => ChallengeKind::Hcaptcha,
        "image" => ChallengeKind::Image,
        other => anyhow::bail!("unknown challenge provider: {other}"),
    };

    let site_key = report.site_key.filter(|k| !k.is_empty()).or_else(|| {
        report
            .frame_src
            .as_deref()
            .and_then(|src| SITE_KEY_PARAM.captures(src))
            .map(|caps| caps[1].to_string())
    });

    Ok(Some(Challenge {
        kind,
        site_key,
        image_selector: report.image_selector,
        answer_selector: report.answer_selector,
    }))
}

/// Script returning a JSON array with the text (or `attribute`) of every match.
pub fn select_all_script(selector: &str, attribute: Option<&str>) -> String {
    let selector = js_string(selector);
    let attribute = attribute.map(js_string).unwrap_or_else(|| "null".into());
    format!(
        r#"(() => {{
  const attr = {attribute};
  const els = Array.from(document.querySelectorAll({selector}));
  return JSON.stringify(els.map(el => attr
    ? (el.getAttribute(attr) ?? '')
    : (el.innerText || el.textContent || '').trim()));
}})()"#
    )
}

pub fn clear_value_script(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (el) el.value = ''; }})()",
        js_string(selector)
    )
}

/// Script writing a solver token into the response field the widget submits.
pub fn token_injection_script(kind: ChallengeKind, token: &str) -> String {
    let names = match kind {
        ChallengeKind::Hcaptcha => r#"['h-captcha-response', 'g-recaptcha-response']"#,
        _ => r#"['g-recaptcha-response']"#,
    };
    format!(
        r#"(() => {{
  const token = {token};
  for (const name of {names}) {{
    document.querySelectorAll(`textarea[name="${{name}}"], #${{name}}`).forEach(el => {{
      el.style.display = 'block';
      el.value = token;
    }});
  }}
}})()"#,
        token = js_string(token),
    )
}

pub fn scroll_script(dy: i64) -> String {
    format!("window.scrollBy(0, {dy})")
}

fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// Evaluate a script that yields a string; missing values become "".
pub fn eval_string(tab: &Arc<Tab>, script: &str) -> Result<String> {
    let result = tab.evaluate(script, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

pub fn probe_challenge(tab: &Arc<Tab>) -> Result<Option<Challenge>> {
    parse_probe(&eval_string(tab, PROBE_CHALLENGE_JS)?)
}

pub fn select_all(tab: &Arc<Tab>, selector: &str, attribute: Option<&str>) -> Result<Vec<String>> {
    let raw = eval_string(tab, &select_all_script(selector, attribute))?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("selector {selector} returned non-list"))
}

/// Get the current page URL.
pub fn get_current_url(tab: &Arc<Tab>) -> Result<String> {
    let url = eval_string(tab, "window.location.href")?;
    Ok(if url.is_empty() { tab.get_url() } else { url })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_page_has_no_challenge() {
        assert_eq!(parse_probe("").unwrap(), None);
        assert_eq!(parse_probe("  \n").unwrap(), None);
    }

    #[test]
    fn site_key_from_holder_attribute() {
        let raw = r#"{"provider":"recaptcha","frame_src":"","site_key":"6Lc-abc"}"#;
        let challenge = parse_probe(raw).unwrap().unwrap();
        assert_eq!(challenge.kind, ChallengeKind::RecaptchaV2);
        assert_eq!(challenge.site_key.as_deref(), Some("6Lc-abc"));
    }

    #[test]
    fn site_key_falls_back_to_iframe_src() {
        let raw = r#"{"provider":"recaptcha","frame_src":"https://www.google.com/recaptcha/api2/anchor?ar=1&k=6LdKEY&co=aHR0","site_key":null}"#;
        let challenge = parse_probe(raw).unwrap().unwrap();
        assert_eq!(challenge.site_key.as_deref(), Some("6LdKEY"));

        let raw = r#"{"provider":"hcaptcha","frame_src":"https://newassets.hcaptcha.com/captcha/v1/x/static/hcaptcha.html#frame=checkbox&sitekey=10000000-ffff","site_key":""}"#;
        let challenge = parse_probe(raw).unwrap().unwrap();
        assert_eq!(challenge.kind, ChallengeKind::Hcaptcha);
        assert_eq!(challenge.site_key.as_deref(), Some("10000000-ffff"));
    }

    #[test]
    fn image_challenge_carries_locators() {
        let raw = r#"{"provider":"image","image_selector":"[data-harvest-challenge=\"image\"]","answer_selector":null}"#;
        let challenge = parse_probe(raw).unwrap().unwrap();
        assert_eq!(challenge.kind, ChallengeKind::Image);
        assert!(challenge.image_selector.is_some());
        assert_eq!(challenge.answer_selector, None);
        assert_eq!(challenge.site_key, None);
    }

    #[test]
    fn unknown_provider_is_an_error() {
        assert!(parse_probe(r#"{"provider":"turnstile"}"#).is_err());
    }

    #[test]
    fn scripts_quote_their_inputs() {
        let script = select_all_script(r#"a[title="it's"]"#, Some("href"));
        assert!(script.contains(r#""a[title=\"it's\"]""#));
        assert!(script.contains(r#"const attr = "href";"#));

        let script = select_all_script(".price", None);
        assert!(script.contains("const attr = null;"));

        let script = token_injection_script(ChallengeKind::Hcaptcha, "tok\"en");
        assert!(script.contains(r#"const token = "tok\"en";"#));
        assert!(script.contains("h-captcha-response"));
    }
}
