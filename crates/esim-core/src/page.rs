//! Script injected into the embedded page so it can reach the bridge.

/// Name under which the host exposes [`SyncBridge`](crate::bridge::SyncBridge)
/// to page scripts. The object must offer `call(method, argsJson)` returning an
/// envelope string.
pub const NATIVE_INTERFACE: &str = "__esimNative";

/// Installs `window.EsimBridge` with promise-returning methods, then fires
/// `esimBridgeReady` on `window`. Injecting it twice is harmless.
///
/// Each promise resolves with the whole envelope, failures and timeouts
/// included. It rejects only when the host call throws or answers with
/// something that is not a JSON object.
pub const PAGE_BRIDGE_SCRIPT: &str = r#"(function () {
  if (window.EsimBridge) {
    return;
  }
  var native = window.__esimNative;

  function call(method, args) {
    return new Promise(function (resolve, reject) {
      if (!native || typeof native.call !== "function") {
        reject({ success: false, code: "BRIDGE_CLOSED", error: "native bridge missing" });
        return;
      }
      var reply;
      try {
        var raw = native.call(method, args === undefined ? null : JSON.stringify(args));
        reply = JSON.parse(raw);
      } catch (err) {
        reject({ success: false, code: "EXCEPTION", error: String(err) });
        return;
      }
      if (reply === null || typeof reply !== "object") {
        reject({ success: false, code: "EXCEPTION", error: "malformed bridge reply" });
        return;
      }
      resolve(reply);
    });
  }

  window.EsimBridge = {
    isSupportESim: function () {
      return call("isSupportESim");
    },
    installEsimProfile: function (code) {
      return call("installEsimProfile", code);
    }
  };
  window.dispatchEvent(new Event("esimBridgeReady"));
})();
"#;
