//! The single-page form.

use crate::state::WebState;

const TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Dreambooth on Kiln</title>
  <link rel="icon" href="/favicon.ico" type="image/svg+xml">
  <link rel="stylesheet" href="/assets/index.css">
</head>
<body>
  <main class="container">
    <h1>Dream up images of {phrase}.</h1>
    <p>Describe what they are doing or how a particular artist or style would depict them. Be fantastical! Try the examples below for inspiration.</p>
    <div class="row">
      <textarea id="prompt" rows="10" placeholder="Describe the version of {phrase} you'd like to see"></textarea>
      <div id="output"><img id="image" width="512" height="512" alt=""></div>
    </div>
    <div class="row">
      <button id="dream" class="primary">Dream</button>
      <span id="status"></span>
    </div>
    <div class="examples">
{examples}
    </div>
  </main>
  <script>
    const prompt = document.getElementById("prompt");
    const image = document.getElementById("image");
    const status = document.getElementById("status");
    const dream = document.getElementById("dream");
    document.querySelectorAll("button.example").forEach((b) => {
      b.addEventListener("click", () => { prompt.value = b.dataset.prompt; });
    });
    dream.addEventListener("click", async () => {
      dream.disabled = true;
      status.textContent = "Dreaming...";
      try {
        const resp = await fetch("/api/dream", {
          method: "POST",
          headers: { "Content-Type": "application/json" },
          body: JSON.stringify({ text: prompt.value }),
        });
        if (!resp.ok) {
          const err = await resp.json();
          throw new Error(err.error);
        }
        image.src = URL.createObjectURL(await resp.blob());
        status.textContent = "";
      } catch (e) {
        status.textContent = e.message;
      } finally {
        dream.disabled = false;
      }
    });
  </script>
</body>
</html>
"#;

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render(state: &WebState) -> String {
    let examples = state
        .examples
        .iter()
        .map(|p| {
            let p = escape_html(p);
            format!(r#"      <button class="example secondary" data-prompt="{p}">{p}</button>"#)
        })
        .collect::<Vec<_>>()
        .join("\n");

    TEMPLATE
        .replace("{phrase}", &escape_html(&state.instance_phrase()))
        .replace("{examples}", &examples)
}
