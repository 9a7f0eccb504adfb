use maud::{DOCTYPE, Markup, PreEscaped, html};

use crate::model::ThermoModel;

const BOOTSTRAP_CSS: &str = "https://cdn.jsdelivr.net/npm/bootstrap@5.2.2/dist/css/bootstrap.min.css";

/// Live part of the page, re-rendered after every change.
pub fn render(model: &ThermoModel) -> anyhow::Result<String> {
    Ok(live_view(model).into_string())
}

fn live_view(model: &ThermoModel) -> Markup {
    html! {
        h4 { "User: " (model.name) }
        h2 { "Temperature: " (format!("{:.1}", model.temperature)) "C" }
        div {
            @if model.too_hot() {
                h4 style="color: red" { "Warning: Temperature is too high!!! (over 25C)" }
            }
        }
        div style="padding-top: 20px" {
            button data-event="temp-up" class="btn btn-success btn-sm" { "+0.1C" }
            " - "
            button data-event="temp-down" class="btn btn-success btn-sm" { "-0.1C" }
        }
        div style="padding-top: 20px; padding-bottom: 20px" {
            button data-event="temp-change" data-temperature="2" class="btn btn-success btn-sm" { "+2C" }
            " - "
            button data-event="temp-change" data-temperature="-2" class="btn btn-success btn-sm" { "-2C" }
        }
        div style="border: 1px solid black; padding: 5px" {
            span { (model.time) }
        }
        // Picked up by the client and prepended to the status log
        div hidden data-status data-seq=(model.status_seq) { (model.status) }
    }
}

/// Full document served by the plain HTTP request, wrapping the first render.
pub fn page(initial: &str) -> Markup {
    html! {
        (DOCTYPE)
        html {
            head {
                title { "Thermostat" }
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                link rel="stylesheet" href=(BOOTSTRAP_CSS);
            }
            body {
                div class="container" style="text-align: center" {
                    div id="live-root" { (PreEscaped(initial)) }
                    div style="padding: 10px" {
                        form id="message-form" {
                            input type="text" name="message";
                            (PreEscaped("&#160;"))
                            input type="submit" value="send ..." class="btn btn-success btn-sm";
                        }
                    }
                    div id="live-error" class="text-danger" {}
                    div id="status-log" {}
                }
                script { (PreEscaped(CLIENT_JS)) }
            }
        }
    }
}

const CLIENT_JS: &str = r#"
(function () {
    const root = document.getElementById("live-root");
    const log = document.getElementById("status-log");
    const errors = document.getElementById("live-error");
    const form = document.getElementById("message-form");
    const scheme = location.protocol === "https:" ? "wss://" : "ws://";
    const ws = new WebSocket(scheme + location.host + "/thermostat/ws" + location.search);
    let lastSeq = null;

    function send(name, params) {
        if (ws.readyState !== WebSocket.OPEN) return;
        ws.send(JSON.stringify({ type: "event", name: name, params: params || {} }));
    }

    function noteStatus() {
        const el = root.querySelector("[data-status]");
        if (!el) return;
        const seq = el.dataset.seq;
        if (seq === "0" || seq === lastSeq) return;
        lastSeq = seq;
        const line = document.createElement("div");
        line.textContent = el.textContent.trim();
        log.prepend(line);
    }

    ws.onmessage = function (ev) {
        const msg = JSON.parse(ev.data);
        if (msg.type === "render") {
            root.innerHTML = msg.html;
            errors.textContent = "";
            noteStatus();
        } else if (msg.type === "error") {
            errors.textContent = msg.kind + ": " + msg.message;
        }
    };

    root.addEventListener("click", function (ev) {
        const button = ev.target.closest("[data-event]");
        if (!button) return;
        const params = {};
        if (button.dataset.temperature) params.temperature = button.dataset.temperature;
        send(button.dataset.event, params);
    });

    window.addEventListener("keyup", function (ev) {
        if (ev.target.tagName === "INPUT") return;
        if (ev.key === "ArrowUp") send("temp-up");
        if (ev.key === "ArrowDown") send("temp-down");
    });

    form.addEventListener("submit", function (ev) {
        ev.preventDefault();
        const input = form.querySelector("input[name=message]");
        send("save", { message: input.value });
        input.value = "";
    });
})();
"#;
